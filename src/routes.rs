// Copyright 2021 Joyent, Inc.

//! The route table maps every reachable procedure or peer name to the one
//! connection that reaches it. Later announcements overwrite earlier ones,
//! and each connection remembers the names announced over it so that closing
//! the connection purges exactly its own entries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::conn::Connection;

#[derive(Default)]
pub(crate) struct RouteTable {
    map: RwLock<HashMap<String, Arc<Connection>>>,
}

impl RouteTable {
    /// Inserts or overwrites the route for `name`. The name is recorded on
    /// `conn` and, when the route moves, removed from the connection that
    /// previously held it, keeping the table and the per-connection route
    /// lists mutually consistent.
    pub(crate) fn add(&self, name: &str, conn: &Arc<Connection>) {
        let mut map = self.map.write().unwrap();
        if let Some(old) = map.insert(String::from(name), conn.clone()) {
            if Arc::ptr_eq(&old, conn) {
                // Re-announcement over the same connection.
                return;
            }
            old.routes.lock().unwrap().retain(|n| n != name);
        }
        conn.routes.lock().unwrap().push(String::from(name));
    }

    pub(crate) fn find(&self, name: &str) -> Option<Arc<Connection>> {
        self.map.read().unwrap().get(name).cloned()
    }

    /// Removes every route announced over `conn`. Called when the connection
    /// closes.
    pub(crate) fn remove_all_for(&self, conn: &Connection) {
        let mut map = self.map.write().unwrap();
        let names: Vec<String> =
            conn.routes.lock().unwrap().drain(..).collect();
        for name in names {
            if let Some(cur) = map.get(&name) {
                if std::ptr::eq(Arc::as_ptr(cur), conn) {
                    map.remove(&name);
                }
            }
        }
    }

    /// Every name currently routable, in no particular order.
    pub(crate) fn names(&self) -> Vec<String> {
        self.map.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn loopback() -> Arc<Connection> {
        Connection::loopback(
            "test",
            Arc::new(|_: &str, _: &str| Ok(String::new())),
        )
    }

    fn names_on(conn: &Connection) -> Vec<String> {
        conn.routes.lock().unwrap().clone()
    }

    #[test]
    fn add_find_remove() {
        let table = RouteTable::default();
        let a = loopback();

        table.add("Echo", &a);
        assert!(Arc::ptr_eq(&table.find("Echo").unwrap(), &a));
        assert_eq!(names_on(&a), vec!["Echo"]);

        table.remove_all_for(&a);
        assert!(table.find("Echo").is_none());
        assert!(names_on(&a).is_empty());
    }

    #[test]
    fn later_announcement_wins() {
        let table = RouteTable::default();
        let a = loopback();
        let b = loopback();

        table.add("Echo", &a);
        table.add("Echo", &b);

        assert!(Arc::ptr_eq(&table.find("Echo").unwrap(), &b));
        assert!(names_on(&a).is_empty());
        assert_eq!(names_on(&b), vec!["Echo"]);

        // Closing the connection that lost the route must not disturb the
        // winner's entry.
        table.remove_all_for(&a);
        assert!(table.find("Echo").is_some());
    }

    #[test]
    fn repeat_announcement_does_not_duplicate() {
        let table = RouteTable::default();
        let a = loopback();

        table.add("Echo", &a);
        table.add("Echo", &a);

        assert_eq!(names_on(&a).len(), 1);
        table.remove_all_for(&a);
        assert!(table.find("Echo").is_none());
    }

    #[test]
    fn names_lists_every_route() {
        let table = RouteTable::default();
        let a = loopback();
        table.add("Echo", &a);
        table.add("KV.Get", &a);

        let mut names = table.names();
        names.sort();
        assert_eq!(names, vec!["Echo", "KV.Get"]);
    }
}
