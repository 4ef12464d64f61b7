//! Behavior suite shared by every backend.
//!
//! Each case works in its own directory below the store root, so the suite
//! can run on a store that already holds data.

use anyhow::{bail, ensure, Result};
use tracing::{error, info};
use zkstore_core::{StoreError, ZkStore};

/// Outcome of [`run_behavior_suite`].
#[derive(Debug, Default)]
pub struct SuiteReport {
    /// Cases that passed.
    pub passed: Vec<&'static str>,
    /// Cases that failed, with the reason.
    pub failed: Vec<(&'static str, String)>,
}

impl SuiteReport {
    /// True when every case passed.
    pub fn all_passed(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs every case and collects the results.
pub async fn run_behavior_suite(store: &ZkStore) -> SuiteReport {
    let mut report = SuiteReport::default();
    macro_rules! case {
        ($name:literal, $body:expr) => {
            match $body.await {
                Ok(()) => {
                    info!(case = $name, "passed");
                    report.passed.push($name);
                }
                Err(e) => {
                    error!(case = $name, error = %e, "failed");
                    report.failed.push(($name, format!("{:#}", e)));
                }
            }
        };
    }

    case!("round_trip", round_trip(store));
    case!("empty_payload", empty_payload(store));
    case!("create_dir_idempotent", create_dir_idempotent(store));
    case!("list_ordering", list_ordering(store));
    case!("list_paging", list_paging(store));
    case!("deletion", deletion(store));
    case!("recursive_delete", recursive_delete(store));
    case!("size_boundary", size_boundary(store));
    case!("stat_metadata", stat_metadata(store));
    case!("invalid_paths", invalid_paths(store));
    report
}

async fn round_trip(store: &ZkStore) -> Result<()> {
    store.write("round-trip/a/b/object", b"payload").await?;
    let data = store.read("round-trip/a/b/object").await?;
    ensure!(&data[..] == b"payload", "read back {:?}", data);

    store.write("round-trip/a/b/object", b"replaced").await?;
    let data = store.read("/round-trip/a/b/object").await?;
    ensure!(&data[..] == b"replaced", "overwrite read back {:?}", data);
    Ok(())
}

async fn empty_payload(store: &ZkStore) -> Result<()> {
    store.write("empty/object", b"").await?;
    let data = store.read("empty/object").await?;
    ensure!(data.is_empty(), "expected empty payload, got {} bytes", data.len());
    let entry = store.stat("empty/object").await?;
    ensure!(!entry.is_dir, "empty object reported as directory");
    Ok(())
}

async fn create_dir_idempotent(store: &ZkStore) -> Result<()> {
    store.create_dir("mkdir/x/y").await?;
    store.write("mkdir/x/y/child", b"1").await?;
    store.create_dir("mkdir/x/y").await?;
    store.create_dir("mkdir/x/").await?;

    ensure!(store.stat("mkdir/x/y").await?.is_dir, "mkdir/x/y is not a directory");
    let children = store.list("mkdir/x/y").await?;
    ensure!(children.len() == 1, "create_dir touched children: {:?}", children);
    Ok(())
}

async fn list_ordering(store: &ZkStore) -> Result<()> {
    for name in ["b", "a", "c"] {
        store.write(&format!("order/{}", name), name.as_bytes()).await?;
    }
    let names: Vec<String> = store
        .list("order")
        .await?
        .into_iter()
        .map(|e| e.name().to_string())
        .collect();
    ensure!(names == ["a", "b", "c"], "unexpected order {:?}", names);
    Ok(())
}

async fn list_paging(store: &ZkStore) -> Result<()> {
    let expected: Vec<String> = (0..7).map(|i| format!("item-{:02}", i)).collect();
    for name in expected.iter().rev() {
        store.write(&format!("paging/{}", name), b"x").await?;
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..expected.len() + 1 {
        let page = store.list_page("paging", cursor.as_deref(), 3).await?;
        ensure!(page.entries.len() <= 3, "page too large");
        seen.extend(page.entries.iter().map(|e| e.name().to_string()));
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    ensure!(seen == expected, "paged listing {:?}", seen);
    Ok(())
}

async fn deletion(store: &ZkStore) -> Result<()> {
    match store.delete("deletion/missing").await {
        Err(StoreError::NotFound { .. }) => {}
        other => bail!("deleting a missing path returned {:?}", other),
    }
    store.write("deletion/dir/leaf", b"1").await?;
    match store.delete("deletion/dir").await {
        Err(StoreError::NotEmpty { .. }) => {}
        other => bail!("deleting a non-empty directory returned {:?}", other),
    }
    store.delete("deletion/dir/leaf").await?;
    store.delete("deletion/dir").await?;
    ensure!(!store.exists("deletion/dir").await?, "directory survived delete");
    Ok(())
}

async fn recursive_delete(store: &ZkStore) -> Result<()> {
    store.write("tree/a/b/c", b"1").await?;
    store.write("tree/a/d", b"2").await?;
    store.create_dir("tree/e").await?;
    store.delete_all("tree").await?;
    ensure!(!store.exists("tree").await?, "tree survived delete_all");
    Ok(())
}

async fn size_boundary(store: &ZkStore) -> Result<()> {
    let max = store.max_payload_size();
    store.write("size/exact", &vec![0xab; max]).await?;
    ensure!(
        store.read("size/exact").await?.len() == max,
        "payload of exactly the limit not read back"
    );
    match store.write("size/over", &vec![0xab; max + 1]).await {
        Err(StoreError::PayloadTooLarge { size, max_size })
            if size == max + 1 && max_size == max => {}
        other => bail!("oversized write returned {:?}", other),
    }
    ensure!(!store.exists("size/over").await?, "oversized write left a node");
    Ok(())
}

async fn stat_metadata(store: &ZkStore) -> Result<()> {
    store.write("meta/object", b"12345").await?;
    let entry = store.stat("meta/object").await?;
    ensure!(!entry.is_dir, "object reported as directory");
    ensure!(entry.content_length == 5, "content length {}", entry.content_length);
    ensure!(entry.last_modified.is_some(), "missing last modified");

    let dir = store.stat("meta").await?;
    ensure!(dir.is_dir && dir.children == 1, "unexpected dir entry {:?}", dir);
    ensure!(store.exists("meta/").await?, "directory-style key not found");
    ensure!(!store.exists("meta/nothing").await?, "phantom entry");
    Ok(())
}

async fn invalid_paths(store: &ZkStore) -> Result<()> {
    for key in ["bad//key", "bad/../key", "bad/\u{1}"] {
        match store.write(key, b"x").await {
            Err(StoreError::InvalidPath { .. }) => {}
            other => bail!("write to {:?} returned {:?}", key, other),
        }
    }
    match store.write("/", b"x").await {
        Err(StoreError::InvalidPath { .. }) => Ok(()),
        other => bail!("write to the root returned {:?}", other),
    }
}
