use std::env;

use anyhow::{bail, Context, Result};
use env_logger::Env;

use pst_btree::geometry::driver_geometry;
use pst_btree::{Btree, FileNodeStore, InsertOutcome, RemoveOutcome};

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!(
            "usage: {} <file> <create | insert <key> <value> | get <key> | delete <key>>",
            args.first().map(String::as_str).unwrap_or("pst-btree")
        );
    }

    let geom = driver_geometry();
    let path = &args[1];
    let command = args[2].as_str();

    let mut store = FileNodeStore::open(path, geom.node_size).context("opening backing file")?;
    let root_ref = store.read_root_ref()?;
    let mut tree = Btree::new(store, geom, root_ref);

    match command {
        "create" => {
            if tree.root_ref().is_some() {
                bail!("{path} already has a root; refusing to re-create");
            }
            tree.create_empty()?;
            log::info!("created empty tree at {path}");
        }
        "insert" => {
            let (key, value) = parse_key_value(&args[3..], geom.leaf_entry_size - geom.key_size)?;
            match tree.insert(key, &value)? {
                InsertOutcome::Inserted => println!("inserted {key}"),
                InsertOutcome::Duplicate => println!("{key} already present"),
            }
        }
        "get" => {
            let key = parse_key(&args[3..])?;
            match tree.search(key)? {
                Some(value) => println!("{key} -> {}", hex_string(&value)),
                None => println!("{key} not found"),
            }
        }
        "delete" => {
            let key = parse_key(&args[3..])?;
            match tree.remove(key)? {
                RemoveOutcome::Removed => println!("removed {key}"),
                RemoveOutcome::NotPresent => println!("{key} not found"),
            }
        }
        other => bail!("unknown command {other}"),
    }

    if let Some(root_ref) = tree.root_ref() {
        tree.store_mut().write_root_ref(root_ref)?;
    }
    Ok(())
}

fn parse_key(rest: &[String]) -> Result<u64> {
    rest.first()
        .context("missing <key> argument")?
        .parse()
        .context("key must be an unsigned integer")
}

fn parse_key_value(rest: &[String], value_len: usize) -> Result<(u64, Vec<u8>)> {
    let key = rest
        .first()
        .context("missing <key> argument")?
        .parse()
        .context("key must be an unsigned integer")?;
    let raw = rest.get(1).context("missing <value> argument")?.as_bytes();
    let mut value = vec![0u8; value_len];
    let copy_len = raw.len().min(value_len);
    value[..copy_len].copy_from_slice(&raw[..copy_len]);
    Ok((key, value))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
