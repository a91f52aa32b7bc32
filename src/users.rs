//! User attribution for the emit phase.
//!
//! `UserStore` combines the `uid -> display name` map (public users only)
//! with the `changeset -> uid` side table. The user map is loaded once
//! from the sorted `users` run; the changeset table is populated by the
//! changeset pass and only read afterwards, which is why a plain `RwLock`
//! suffices.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::DumpResult;
use crate::records::codec::Codec;
use crate::sort::TypedRunReader;
use crate::types::User;

/// Changeset ids are dense from 1, so the side table is a paged array
/// rather than a hash map: pages of 2^17 slots, allocated on demand,
/// `-1` marking unset slots.
const PAGE_BITS: u32 = 17;
const PAGE_SIZE: usize = 1 << PAGE_BITS;
const PAGE_MASK: i64 = (PAGE_SIZE as i64) - 1;

#[derive(Default)]
struct ChangesetAuthors {
    pages: Vec<Option<Box<[i64]>>>,
}

impl ChangesetAuthors {
    fn insert(&mut self, changeset_id: i64, uid: i64) {
        debug_assert!(changeset_id > 0);
        debug_assert!(uid >= 0);

        let page_index = (changeset_id >> PAGE_BITS) as usize;
        let offset = (changeset_id & PAGE_MASK) as usize;

        if page_index >= self.pages.len() {
            self.pages.resize_with(page_index + 1, || None);
        }
        let page = self.pages[page_index]
            .get_or_insert_with(|| vec![-1i64; PAGE_SIZE].into_boxed_slice());
        page[offset] = uid;
    }

    fn get(&self, changeset_id: i64) -> Option<i64> {
        if changeset_id < 1 {
            return None;
        }
        let page_index = (changeset_id >> PAGE_BITS) as usize;
        let offset = (changeset_id & PAGE_MASK) as usize;
        let uid = *self.pages.get(page_index)?.as_ref()?.get(offset)?;
        if uid < 0 { None } else { Some(uid) }
    }
}

/// A resolved author: the public user id and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub uid: i64,
    pub name: Arc<str>,
}

/// Authoritative map from user id to display name plus the
/// changeset-to-author side table.
pub struct UserStore {
    display_names: HashMap<i64, Arc<str>>,
    changeset_authors: RwLock<ChangesetAuthors>,
}

impl UserStore {
    /// Builds the store from the sorted `users` run, keeping only users
    /// whose data is public.
    pub fn load(users_run: &Path, codec: Codec) -> DumpResult<Self> {
        let mut reader = TypedRunReader::<User>::open("users", users_run, codec)?;
        let mut display_names = HashMap::new();
        while let Some(user) = reader.next_record()? {
            if user.data_public {
                display_names.insert(user.id, Arc::from(user.display_name.as_str()));
            }
        }

        info!(public_users = display_names.len(), "loaded user map");
        Ok(Self {
            display_names,
            changeset_authors: RwLock::new(ChangesetAuthors::default()),
        })
    }

    /// An empty store, for outputs that carry no attribution.
    pub fn empty() -> Self {
        Self {
            display_names: HashMap::new(),
            changeset_authors: RwLock::new(ChangesetAuthors::default()),
        }
    }

    /// Records a changeset's author. Called by the changeset pass; the
    /// table is read-only once that pass completes.
    pub fn record_changeset(&self, changeset_id: i64, uid: i64) {
        if changeset_id < 1 || uid < 0 {
            return;
        }
        self.changeset_authors
            .write()
            .expect("changeset author lock poisoned")
            .insert(changeset_id, uid);
    }

    /// Resolves a user id to its display name, if the user is public.
    pub fn user(&self, uid: i64) -> Option<UserRef> {
        let name = self.display_names.get(&uid)?;
        Some(UserRef {
            uid,
            name: name.clone(),
        })
    }

    /// Resolves the author of a changeset, if known and public.
    pub fn user_for_changeset(&self, changeset_id: i64) -> Option<UserRef> {
        let uid = self
            .changeset_authors
            .read()
            .expect("changeset author lock poisoned")
            .get(changeset_id)?;
        self.user(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_users(users: &[(i64, &str)]) -> UserStore {
        let mut display_names = HashMap::new();
        for (uid, name) in users {
            display_names.insert(*uid, Arc::from(*name));
        }
        UserStore {
            display_names,
            changeset_authors: RwLock::new(ChangesetAuthors::default()),
        }
    }

    #[test]
    fn resolves_recorded_changesets() {
        let store = store_with_users(&[(7, "Alice")]);
        store.record_changeset(10, 7);

        let user = store.user_for_changeset(10).unwrap();
        assert_eq!(user.uid, 7);
        assert_eq!(&*user.name, "Alice");
    }

    #[test]
    fn unknown_changeset_or_private_user_resolves_to_none() {
        let store = store_with_users(&[(7, "Alice")]);
        store.record_changeset(10, 99); // uid not in the public map

        assert!(store.user_for_changeset(10).is_none());
        assert!(store.user_for_changeset(11).is_none());
        assert!(store.user_for_changeset(-3).is_none());
        assert!(store.user_for_changeset(0).is_none());
    }

    #[test]
    fn authors_span_page_boundaries() {
        let store = store_with_users(&[(1, "A"), (2, "B")]);
        let last_of_first_page = (PAGE_SIZE as i64) - 1;
        store.record_changeset(last_of_first_page, 1);
        store.record_changeset(last_of_first_page + 1, 2);

        assert_eq!(store.user_for_changeset(last_of_first_page).unwrap().uid, 1);
        assert_eq!(
            store.user_for_changeset(last_of_first_page + 1).unwrap().uid,
            2
        );
    }

    #[test]
    fn invalid_inserts_are_ignored() {
        let store = store_with_users(&[(7, "Alice")]);
        store.record_changeset(0, 7);
        store.record_changeset(-5, 7);
        store.record_changeset(5, -1);
        assert!(store.user_for_changeset(5).is_none());
    }
}
