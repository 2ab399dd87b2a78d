//! Event tracker sync persisted through `SqliteLogStore`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use chaintrack_core::{
    Block, BlockTag, BlockTracker, ChainProvider, EventTracker, FilterConfig, Log, LogQuery,
    LogSelector, LogStore, ProviderError, TrackerConfig,
};
use chaintrack_storage::SqliteLogStore;

const CONTRACT: &str = "0xc0ffee0000000000000000000000000000000000";

/// A chain that never forks: block `n` has hash `n` and a log every third
/// block.
struct LinearChain {
    head: AtomicU64,
}

fn hash(n: u64) -> String {
    format!("0x{n:064x}")
}

fn block(n: u64) -> Block {
    Block {
        number: n,
        hash: hash(n),
        parent_hash: if n == 0 { hash(u64::MAX) } else { hash(n - 1) },
        timestamp: n * 12,
    }
}

fn logs_at(n: u64) -> Vec<Log> {
    if n == 0 || n % 3 != 0 {
        return Vec::new();
    }
    vec![Log {
        address: CONTRACT.into(),
        topics: vec![],
        data: "0x".into(),
        block_number: n,
        block_hash: hash(n),
        transaction_hash: format!("0x{:064x}", n + 1_000_000),
        transaction_index: 0,
        log_index: 0,
    }]
}

impl LinearChain {
    fn new(head: u64) -> Arc<Self> {
        Arc::new(Self {
            head: AtomicU64::new(head),
        })
    }

    fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    fn number_of(&self, hash: &str) -> Option<u64> {
        let n = u64::from_str_radix(hash.trim_start_matches("0x"), 16).ok()?;
        (n <= self.head()).then_some(n)
    }
}

#[async_trait]
impl ChainProvider for LinearChain {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        Ok(self.head())
    }

    async fn block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, ProviderError> {
        let n = match tag {
            BlockTag::Latest => self.head(),
            BlockTag::Number(n) => n,
        };
        Ok((n <= self.head()).then(|| block(n)))
    }

    async fn block_by_hash(&self, hash: &str, _full_tx: bool) -> Result<Option<Block>, ProviderError> {
        Ok(self.number_of(hash).map(block))
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, ProviderError> {
        let blocks: Vec<u64> = match &query.selector {
            LogSelector::Range { from, to } => (*from..=(*to).min(self.head())).collect(),
            LogSelector::BlockHash(h) => self.number_of(h).into_iter().collect(),
        };
        Ok(blocks
            .into_iter()
            .flat_map(logs_at)
            .filter(|l| query.filter.matches(l))
            .collect())
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(31_337)
    }
}

fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("chaintrack-{}-{name}.db", std::process::id()));
    remove_db(&path);
    path
}

fn remove_db(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

fn tracker(chain: &Arc<LinearChain>, store: Arc<dyn LogStore>) -> EventTracker<LinearChain> {
    let config = TrackerConfig {
        max_block_backlog: 5,
        batch_size: 10,
        filter: FilterConfig::address(CONTRACT),
        ..TrackerConfig::default()
    };
    let blocks = Arc::new(BlockTracker::new(chain.clone(), config.max_block_backlog));
    EventTracker::new(chain.clone(), store, blocks, config)
}

#[tokio::test]
async fn sync_resumes_from_reopened_database() {
    let path = temp_db("resume");
    let url = path.to_string_lossy().into_owned();
    let chain = LinearChain::new(100);

    {
        let store = Arc::new(SqliteLogStore::open(&url).await.unwrap());
        let et = tracker(&chain, store.clone());
        let head = et.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(head.number, 100);
        assert_eq!(et.entry().await.unwrap().last_index().await.unwrap(), 33);
        store.close().await;
    }

    chain.head.store(130, Ordering::SeqCst);
    let store = Arc::new(SqliteLogStore::open(&url).await.unwrap());
    let et = tracker(&chain, store.clone());
    let mut events = et.subscribe();
    let head = et.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(head.number, 130);

    let entry = et.entry().await.unwrap();
    let logs = entry.logs().await.unwrap();
    let expected: Vec<u64> = (1..=130).filter(|n| n % 3 == 0).collect();
    assert_eq!(logs.iter().map(|l| l.block_number).collect::<Vec<_>>(), expected);
    assert_eq!(entry.get_last_block().await.unwrap(), Some(block(130)));
    assert_eq!(entry.genesis().await.unwrap().unwrap().chain_id, 31_337);

    // The resumed run only appends.
    let first = events.try_next().unwrap().unwrap();
    assert!(first.removed.is_empty());
    assert!(first.added.iter().all(|l| l.block_number > 100));

    store.close().await;
    remove_db(&path);
}

#[tokio::test]
async fn entries_survive_reopen_keyed_by_fingerprint() {
    let path = temp_db("fingerprint");
    let url = path.to_string_lossy().into_owned();

    {
        let store = SqliteLogStore::open(&url).await.unwrap();
        let entry = store.get_entry(&FilterConfig::address("0xAB")).await.unwrap();
        entry.upsert_genesis(1, "0xgenesis").await.unwrap();
        entry
            .store_event(&chaintrack_core::Event::append(logs_at(3), block(3)))
            .await
            .unwrap();
        store.get_entry(&FilterConfig::default()).await.unwrap();
        store.close().await;
    }

    let store = SqliteLogStore::open(&url).await.unwrap();
    assert_eq!(store.entry_count().await.unwrap(), 2);

    let entry = store.get_entry(&FilterConfig::address("0xab")).await.unwrap();
    assert_eq!(entry.last_index().await.unwrap(), 1);
    assert_eq!(entry.get_last_block().await.unwrap(), Some(block(3)));
    assert_eq!(entry.genesis().await.unwrap().unwrap().genesis_hash, "0xgenesis");

    let other = store.get_entry(&FilterConfig::default()).await.unwrap();
    assert_eq!(other.last_index().await.unwrap(), 0);
    assert!(other.genesis().await.unwrap().is_none());

    store.close().await;
    remove_db(&path);
}
