use ixdb_core::{encode_identity, now_millis, MetricId, Scope, Tag, TimeRange};
use ixdb_index::{IndexCaches, IndexConfig, IndexDb, SearchOptions, TagFilters};
use ixdb_storage::{IndexTable, IndexTableConfig, WalDurability};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

struct TestEnv {
    table: Arc<IndexTable>,
    db: IndexDb,
    dir: TempDir,
}

impl TestEnv {
    fn new(config: IndexConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let (table, db) = open(&dir, config);
        Self { table, db, dir }
    }

    /// Close everything and open the same directory with cold caches
    fn reopen(self) -> Self {
        let TestEnv { table, db, dir } = self;
        let config = db.config().clone();
        db.flush().unwrap();
        drop(db);
        table.close().unwrap();
        drop(table);

        let (table, db) = open(&dir, config);
        Self { table, db, dir }
    }
}

fn open(dir: &TempDir, config: IndexConfig) -> (Arc<IndexTable>, IndexDb) {
    let table_config = IndexTableConfig {
        wal_durability: WalDurability::EveryWrite,
        ..IndexTableConfig::persistent(dir.path())
    };
    let table = Arc::new(IndexTable::open(table_config).unwrap());
    let db = IndexDb::open(table.clone(), IndexCaches::new(&config), config).unwrap();
    (table, db)
}

fn identity(scope: Scope, group: &str, tags: &[(&str, String)]) -> Vec<u8> {
    let tags: Vec<Tag> = tags.iter().map(|(k, v)| Tag::new(*k, v.as_str())).collect();
    encode_identity(scope, group.as_bytes(), &tags).unwrap()
}

fn host_series(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| identity(Scope::new(1, 1), "cpu", &[("host", format!("h{}", i))]))
        .collect()
}

#[test]
fn registrations_survive_reopen() {
    let env = TestEnv::new(IndexConfig {
        id_block_size: 8,
        ..Default::default()
    });
    let ts = now_millis();
    let names = host_series(20);
    let before: Vec<_> = names
        .iter()
        .map(|n| env.db.get_or_create_tsid(n, ts).unwrap())
        .collect();

    let env = env.reopen();
    for (name, tsid) in names.iter().zip(&before) {
        assert_eq!(env.db.get_or_create_tsid(name, ts).unwrap(), *tsid);
    }
    assert_eq!(env.db.stats().series_created, 0);
    assert_eq!(env.db.series_count(Scope::new(1, 1)).unwrap(), 20);

    // Identities and TSIDs are reachable by metric id
    let mn = env
        .db
        .search_metric_name(Scope::new(1, 1), before[3].metric_id)
        .unwrap();
    assert_eq!(mn.get_tag_value(b"host"), Some(&b"h3"[..]));
    assert_eq!(
        env.db
            .get_tsid_by_metric_id(Scope::new(1, 1), before[3].metric_id)
            .unwrap(),
        before[3]
    );

    // Ids handed out before the restart are never reused
    let max_before = before.iter().map(|t| t.metric_id).max().unwrap();
    let fresh = identity(Scope::new(1, 1), "cpu", &[("host", "new".to_string())]);
    assert!(env.db.get_or_create_tsid(&fresh, ts).unwrap().metric_id > max_before);
}

#[test]
fn search_after_checkpoint_and_reopen() {
    let env = TestEnv::new(IndexConfig::default());
    let ts = now_millis();
    let names = host_series(10);
    for name in &names[..5] {
        env.db.get_or_create_tsid(name, ts).unwrap();
    }
    env.table.checkpoint().unwrap();
    for name in &names[5..] {
        env.db.get_or_create_tsid(name, ts).unwrap();
    }

    let env = env.reopen();
    let mut tfs = TagFilters::new(Scope::new(1, 1));
    tfs.add("host", "h[0-9]", false, true).unwrap();
    let today = TimeRange::new(ts, ts + 1);
    for tr in [today, TimeRange::default()] {
        let found = env
            .db
            .search_metric_ids(&[tfs.clone()], tr, &SearchOptions::default())
            .unwrap();
        assert_eq!(found.len(), 10);
    }
    assert_eq!(env.db.search_tag_values(Scope::new(1, 1), b"host", 100).unwrap().len(), 10);
}

#[test]
fn today_is_marked_active_after_reopen() {
    let env = TestEnv::new(IndexConfig::default());
    let ts = now_millis();
    let names = host_series(5);
    for name in &names {
        env.db.get_or_create_tsid(name, ts).unwrap();
    }

    let env = env.reopen();
    for name in &names {
        env.db.get_or_create_tsid(name, ts).unwrap();
    }
    assert_eq!(env.db.stats().per_day_writes, 0);
}

#[test]
fn strict_registration_returns_one_id_per_identity() {
    let env = TestEnv::new(IndexConfig {
        strict_registration: true,
        ..Default::default()
    });
    let names = Arc::new(host_series(200));
    let db = Arc::new(env.db);
    let ts = now_millis();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let db = Arc::clone(&db);
            let names = Arc::clone(&names);
            thread::spawn(move || {
                // Each thread walks the identities from a different offset
                (0..names.len())
                    .map(|i| {
                        let idx = (i + t * 25) % names.len();
                        (idx, db.get_or_create_tsid(&names[idx], ts).unwrap().metric_id)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen: Vec<Option<MetricId>> = vec![None; names.len()];
    for handle in handles {
        for (idx, id) in handle.join().unwrap() {
            match seen[idx] {
                Some(prev) => assert_eq!(prev, id, "identity {} got two ids", idx),
                None => seen[idx] = Some(id),
            }
        }
    }

    let distinct: HashSet<_> = seen.iter().flatten().collect();
    assert_eq!(distinct.len(), names.len());
    assert_eq!(db.series_count(Scope::new(1, 1)).unwrap(), names.len() as u64);
    assert_eq!(db.stats().series_created, names.len() as u64);
}

#[test]
fn relaxed_registration_converges() {
    let env = TestEnv::new(IndexConfig::default());
    let names = Arc::new(host_series(100));
    let db = Arc::new(env.db);
    let ts = now_millis();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let names = Arc::clone(&names);
            thread::spawn(move || {
                for name in names.iter() {
                    db.get_or_create_tsid(name, ts).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Once the race is over every identity resolves to one id, and every
    // id maps back to the identity it was created for
    for name in names.iter() {
        let first = db.get_or_create_tsid(name, ts).unwrap();
        let second = db.get_or_create_tsid(name, ts).unwrap();
        assert_eq!(first, second);

        let mn = db.search_metric_name(Scope::new(1, 1), first.metric_id).unwrap();
        assert_eq!(mn.marshal().unwrap(), *name);
    }

    let mut tfs = TagFilters::new(Scope::new(1, 1));
    tfs.add("host", "h1", false, false).unwrap();
    let found = db
        .search_metric_ids(&[tfs], TimeRange::default(), &SearchOptions::default())
        .unwrap();
    assert!(!found.is_empty());
    for id in found {
        let mn = db.search_metric_name(Scope::new(1, 1), id).unwrap();
        assert_eq!(mn.get_tag_value(b"host"), Some(&b"h1"[..]));
    }
}
