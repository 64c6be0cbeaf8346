//! Per-session prepared statement cache.
//!
//! Bounded LRU keyed by normalized SQL. Executions in flight hold a reference
//! on their entry; an entry evicted while referenced is retired and its handle
//! is only handed back for closing once the last reference is released.

use std::collections::HashMap;
use std::sync::Arc;

use crate::statement::StatementInfo;

#[derive(Debug)]
struct Entry {
    info: Arc<StatementInfo>,
    refs: usize,
    tick: u64,
}

#[derive(Debug)]
struct Retired {
    sql: Arc<str>,
    info: Arc<StatementInfo>,
    refs: usize,
}

/// A statement handle the server should be told to close.
pub type Evicted = (Arc<str>, Arc<StatementInfo>);

#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    entries: HashMap<Arc<str>, Entry>,
    retired: Vec<Retired>,
    tick: u64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            retired: Vec::new(),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, sql: &str) -> Option<Arc<StatementInfo>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(sql)?;
        entry.tick = tick;
        Some(Arc::clone(&entry.info))
    }

    /// Look up a statement for an execution; the entry stays alive until
    /// [`release`](Self::release).
    pub fn acquire(&mut self, sql: &str) -> Option<Arc<StatementInfo>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(sql)?;
        entry.tick = tick;
        entry.refs += 1;
        Some(Arc::clone(&entry.info))
    }

    /// Drop a reference taken by `acquire`.
    ///
    /// Returns the handle to close if this was the last reference to a
    /// retired entry.
    pub fn release(&mut self, sql: &str, info: &Arc<StatementInfo>) -> Option<Evicted> {
        if let Some(entry) = self.entries.get_mut(sql)
            && Arc::ptr_eq(&entry.info, info)
        {
            entry.refs = entry.refs.saturating_sub(1);
            return None;
        }
        let idx = self
            .retired
            .iter()
            .position(|r| Arc::ptr_eq(&r.info, info))?;
        let retired = &mut self.retired[idx];
        retired.refs = retired.refs.saturating_sub(1);
        if retired.refs > 0 {
            return None;
        }
        let retired = self.retired.swap_remove(idx);
        Some((retired.sql, retired.info))
    }

    /// Store a freshly prepared statement.
    ///
    /// Returns the handles that must be closed on the server now.
    pub fn insert(&mut self, sql: Arc<str>, info: Arc<StatementInfo>) -> Vec<Evicted> {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&sql)
            && Arc::ptr_eq(&entry.info, &info)
        {
            entry.tick = tick;
            return Vec::new();
        }
        let mut evicted = Vec::new();
        if let Some(old) = self.entries.remove(&sql) {
            evicted.extend(self.retire(Arc::clone(&sql), old));
        }
        while self.entries.len() >= self.capacity {
            let Some(lru) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.tick)
                .map(|(sql, _)| Arc::clone(sql))
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&lru) {
                tracing::trace!(sql = %lru, refs = entry.refs, "evicting statement");
                evicted.extend(self.retire(lru, entry));
            }
        }
        self.entries.insert(
            sql,
            Entry {
                info,
                refs: 0,
                tick,
            },
        );
        evicted
    }

    /// Forget a statement because the caller closed it.
    ///
    /// Returns the handle if it can be closed now; a referenced entry is
    /// closed when its last execution completes.
    pub fn remove(&mut self, sql: &str) -> Option<Arc<StatementInfo>> {
        let (sql, entry) = self.entries.remove_entry(sql)?;
        self.retire(sql, entry).map(|(_, info)| info)
    }

    fn retire(&mut self, sql: Arc<str>, entry: Entry) -> Option<Evicted> {
        if entry.refs == 0 {
            return Some((sql, entry.info));
        }
        self.retired.push(Retired {
            sql,
            info: entry.info,
            refs: entry.refs,
        });
        None
    }

    /// Drop everything; the handles died with the connection.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.retired.clear();
    }
}
