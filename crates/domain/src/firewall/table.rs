use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::common::entity::{Addr, AddressFamily};

use super::entity::IpNetwork;
use super::error::FirewallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub net: IpNetwork,
    /// A negated entry carves an exception out of a broader one.
    pub neg: bool,
}

/// Named address set referenced from rules (`<table>`).
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    entries: Vec<TableEntry>,
}

impl AddressTable {
    /// Most specific entry decides; a negated best match means "not in table".
    pub fn contains(&self, af: AddressFamily, addr: Addr) -> bool {
        self.entries
            .iter()
            .filter(|e| e.net.contains(af, addr))
            .max_by_key(|e| e.net.prefix_len())
            .is_some_and(|e| !e.neg)
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All address tables. Tables outlive ruleset reloads and are written on
/// the packet path by overload handling, hence the interior lock.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: RwLock<HashMap<String, AddressTable>>,
}

impl TableStore {
    /// Create the table if it does not exist yet.
    pub fn define(&self, name: &str) {
        self.write()
            .entry(name.to_string())
            .or_insert_with(AddressTable::default);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Add an entry. Returns `false` if it was already present.
    pub fn add(&self, name: &str, net: IpNetwork) -> Result<bool, FirewallError> {
        self.add_entry(name, TableEntry { net, neg: false })
    }

    pub fn add_entry(&self, name: &str, entry: TableEntry) -> Result<bool, FirewallError> {
        entry.net.validate()?;
        let mut tables = self.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| FirewallError::TableNotFound {
                name: name.to_string(),
            })?;
        if table.entries.contains(&entry) {
            return Ok(false);
        }
        table.entries.push(entry);
        Ok(true)
    }

    /// Remove an entry. Returns `false` if it was not present.
    pub fn delete(&self, name: &str, net: IpNetwork) -> Result<bool, FirewallError> {
        let mut tables = self.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| FirewallError::TableNotFound {
                name: name.to_string(),
            })?;
        let before = table.entries.len();
        table.entries.retain(|e| e.net != net);
        Ok(table.entries.len() != before)
    }

    /// Unknown tables contain nothing.
    pub fn contains(&self, name: &str, af: AddressFamily, addr: Addr) -> bool {
        self.read()
            .get(name)
            .is_some_and(|t| t.contains(af, addr))
    }

    pub fn flush(&self, name: &str) -> Result<usize, FirewallError> {
        let mut tables = self.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| FirewallError::TableNotFound {
                name: name.to_string(),
            })?;
        let removed = table.entries.len();
        table.entries.clear();
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<AddressTable> {
        self.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AddressTable>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AddressTable>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(addr: u32, prefix_len: u8) -> IpNetwork {
        IpNetwork::V4 { addr, prefix_len }
    }

    #[test]
    fn add_and_lookup() {
        let store = TableStore::default();
        store.define("abusers");
        assert!(store.add("abusers", v4(0x0A00_0000, 8)).unwrap());
        assert!(!store.add("abusers", v4(0x0A00_0000, 8)).unwrap());
        assert!(store.contains("abusers", AddressFamily::Inet, Addr::v4(0x0A01_0101)));
        assert!(!store.contains("abusers", AddressFamily::Inet, Addr::v4(0x0B00_0001)));
    }

    #[test]
    fn negated_entry_carves_exception() {
        let store = TableStore::default();
        store.define("t");
        store.add("t", v4(0x0A00_0000, 8)).unwrap();
        store
            .add_entry(
                "t",
                TableEntry {
                    net: v4(0x0A01_0000, 16),
                    neg: true,
                },
            )
            .unwrap();
        assert!(store.contains("t", AddressFamily::Inet, Addr::v4(0x0A02_0001)));
        assert!(!store.contains("t", AddressFamily::Inet, Addr::v4(0x0A01_0001)));
    }

    #[test]
    fn unknown_table_is_empty_and_errors_on_write() {
        let store = TableStore::default();
        assert!(!store.contains("nope", AddressFamily::Inet, Addr::v4(1)));
        assert!(matches!(
            store.add("nope", v4(1, 32)),
            Err(FirewallError::TableNotFound { .. })
        ));
    }

    #[test]
    fn delete_and_flush() {
        let store = TableStore::default();
        store.define("t");
        store.add("t", v4(1, 32)).unwrap();
        store.add("t", v4(2, 32)).unwrap();
        assert!(store.delete("t", v4(1, 32)).unwrap());
        assert!(!store.delete("t", v4(1, 32)).unwrap());
        assert_eq!(store.flush("t").unwrap(), 1);
        assert!(store.get("t").unwrap().is_empty());
    }

    #[test]
    fn define_keeps_existing_entries() {
        let store = TableStore::default();
        store.define("t");
        store.add("t", v4(1, 32)).unwrap();
        store.define("t");
        assert_eq!(store.get("t").map(|t| t.len()), Some(1));
        assert_eq!(store.names(), vec!["t".to_string()]);
    }
}
