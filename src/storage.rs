use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, IVec, Transactional, Tree};
use std::convert::Infallible;
use std::path::Path;
use tracing::{debug, warn};

use crate::authz::Authorized;
use crate::error::StorageError;
use crate::models::{
    Action, ActionCounts, ActionId, ActionType, Collection, CollectionId, CollectionPatch, NewAction,
    NewCollection, NewUser, Page, User, UserId,
};

/// Sled-backed persistence for users, collections and their cards.
///
/// Trees:
/// - `users`: user id -> JSON user
/// - `users_by_email`: email -> user id (uniqueness index)
/// - `collections`: collection id -> JSON collection
/// - `actions`: collection id ++ action id -> JSON action (prefix-scannable per collection)
/// - `action_parents`: action id -> collection id
///
/// Ids are big-endian so tree order is id order.
#[derive(Clone)] // Clone for sharing across handlers (Sled internals cheap to clone)
pub struct Storage {
    db: Db,
    users: Tree,
    users_by_email: Tree,
    collections: Tree,
    actions: Tree,
    action_parents: Tree,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn action_key(collection: CollectionId, action: ActionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&collection.0.to_be_bytes());
    key[8..].copy_from_slice(&action.0.to_be_bytes());
    key
}

fn decode_id(label: &str, bytes: &[u8]) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StorageError::Corrupt {
        key: label.to_string(),
        reason: format!("expected 8 id bytes, found {}", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(raw))
}

/// Decodes a stored record. Anything that no longer matches the schema,
/// such as an unknown card category, is a data-integrity error.
fn decode<T: DeserializeOwned>(label: &str, bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| {
        warn!(record = label, error = %e, "corrupt record");
        StorageError::Corrupt {
            key: label.to_string(),
            reason: e.to_string(),
        }
    })
}

fn get_json<T: DeserializeOwned>(tree: &Tree, label: &str, key: &[u8]) -> Result<Option<T>, StorageError> {
    match tree.get(key)? {
        Some(bytes) => decode(label, &bytes).map(Some),
        None => Ok(None),
    }
}

fn tx_error(err: TransactionError<Infallible>) -> StorageError {
    match err {
        TransactionError::Abort(never) => match never {},
        TransactionError::Storage(e) => StorageError::Sled(e),
    }
}

fn put_json<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> Result<(), StorageError> {
    tree.insert(key, serde_json::to_vec(value)?)?;
    Ok(())
}

impl Storage {
    /// Open or create the Sled database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            users: db.open_tree("users")?,
            users_by_email: db.open_tree("users_by_email")?,
            collections: db.open_tree("collections")?,
            actions: db.open_tree("actions")?,
            action_parents: db.open_tree("action_parents")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    // Sled ids start at zero; zero is kept free as "no id".
    fn next_id(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()? + 1)
    }

    // --- Users ---

    /// Inserts a user, reserving its email in the uniqueness index first.
    pub fn create_user(&self, new: NewUser) -> Result<User, StorageError> {
        let id = self.next_id()?;
        self.reserve_email(&new.email, id)?;

        let now = Utc::now();
        let user = User {
            id,
            name: new.name,
            surname: new.surname,
            email: new.email,
            password_hash: new.password_hash,
            phone: new.phone,
            image_url: String::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        };
        put_json(&self.users, &id_key(id), &user)?;
        debug!(user_id = id, "user created");
        Ok(user)
    }

    fn reserve_email(&self, email: &str, id: UserId) -> Result<(), StorageError> {
        self.users_by_email
            .compare_and_swap(email.as_bytes(), None as Option<&[u8]>, Some(id_key(id).to_vec()))?
            .map_err(|_| StorageError::EmailTaken)
    }

    pub fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StorageError> {
        get_json(&self.users, &format!("users/{}", id), &id_key(id))
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        match self.users_by_email.get(email.as_bytes())? {
            Some(raw) => self.find_user_by_id(decode_id("users_by_email", &raw)?),
            None => Ok(None),
        }
    }

    /// Saves profile changes. A changed email is re-reserved before the old
    /// one is released.
    pub fn update_user(&self, user: &User) -> Result<Option<User>, StorageError> {
        let Some(existing) = self.find_user_by_id(user.id)? else {
            return Ok(None);
        };
        if existing.email != user.email {
            self.reserve_email(&user.email, user.id)?;
            self.users_by_email.remove(existing.email.as_bytes())?;
        }
        let mut updated = user.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Utc::now();
        put_json(&self.users, &id_key(user.id), &updated)?;
        Ok(Some(updated))
    }

    // --- Collections ---

    pub fn create_collection(&self, owner: UserId, new: NewCollection) -> Result<Collection, StorageError> {
        let now = Utc::now();
        let collection = Collection {
            id: CollectionId(self.next_id()?),
            name: new.name,
            description: new.description,
            image_url: new.image_url,
            user_id: owner,
            play_count: 0,
            created_at: now,
            updated_at: now,
        };
        put_json(&self.collections, &id_key(collection.id.0), &collection)?;
        debug!(collection_id = collection.id.0, user_id = owner, "collection created");
        Ok(collection)
    }

    pub fn create_collection_with_actions(
        &self,
        owner: UserId,
        new: NewCollection,
        actions: Vec<NewAction>,
    ) -> Result<(Collection, Vec<Action>), StorageError> {
        let collection = self.create_collection(owner, new)?;
        let mut created = Vec::with_capacity(actions.len());
        for action in actions {
            let position = created.len();
            // Stops early if the owner deleted the collection meanwhile.
            let Some(action) = self.insert_action(collection.id, action, position)? else {
                break;
            };
            created.push(action);
        }
        Ok((collection, created))
    }

    pub fn find_collection(&self, id: CollectionId) -> Result<Option<Collection>, StorageError> {
        get_json(&self.collections, &format!("collections/{}", id.0), &id_key(id.0))
    }

    fn all_collections(&self) -> impl Iterator<Item = Result<Collection, StorageError>> + '_ {
        self.collections.iter().rev().map(|item| {
            let (key, value) = item?;
            decode(&format!("collections/{:?}", key), &value)
        })
    }

    /// Newest first; `page` is 1-based.
    pub fn list_collections(&self, page: usize, size: usize) -> Result<Page<Collection>, StorageError> {
        let page = page.max(1);
        let size = size.max(1);
        let items = self
            .all_collections()
            .skip((page - 1).saturating_mul(size))
            .take(size)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: self.collections.len(),
            page,
            size,
        })
    }

    pub fn collections_by_user(&self, user: UserId) -> Result<Vec<Collection>, StorageError> {
        let mut owned = vec![];
        for collection in self.all_collections() {
            let collection = collection?;
            if collection.user_id == user {
                owned.push(collection);
            }
        }
        Ok(owned)
    }

    /// Most played first, newest first among equals.
    pub fn trending_collections(&self, limit: usize) -> Result<Vec<Collection>, StorageError> {
        let mut all = self.all_collections().collect::<Result<Vec<_>, _>>()?;
        all.sort_by(|a, b| b.play_count.cmp(&a.play_count).then(b.id.0.cmp(&a.id.0)));
        all.truncate(limit);
        Ok(all)
    }

    /// Applies a patch; the owner field is never touched.
    pub fn update_collection(
        &self,
        grant: &Authorized<CollectionId>,
        patch: CollectionPatch,
    ) -> Result<Option<Collection>, StorageError> {
        let id = grant.resource();
        let Some(mut collection) = self.find_collection(id)? else {
            return Ok(None);
        };
        collection.name = patch.name;
        collection.description = patch.description;
        if !patch.image_url.is_empty() {
            collection.image_url = patch.image_url;
        }
        collection.updated_at = Utc::now();
        put_json(&self.collections, &id_key(id.0), &collection)?;
        Ok(Some(collection))
    }

    /// Removes the collection and every card in it.
    ///
    /// The collection row goes first, in a transaction. A card insert either
    /// committed before it and is swept below, or sees no parent and writes
    /// nothing.
    pub fn delete_collection(&self, grant: &Authorized<CollectionId>) -> Result<bool, StorageError> {
        let id = grant.resource();
        let key = id_key(id.0);
        let existed = self
            .collections
            .transaction(|collections| -> ConflictableTransactionResult<bool, Infallible> {
                Ok(collections.remove(&key[..])?.is_some())
            })
            .map_err(tx_error)?;
        if !existed {
            return Ok(false);
        }
        let mut removed = 0usize;
        for item in self.actions.scan_prefix(id_key(id.0)) {
            let (key, _) = item?;
            self.actions.remove(&key)?;
            if let Some(action_id) = key.get(8..) {
                self.action_parents.remove(action_id)?;
            }
            removed += 1;
        }
        debug!(collection_id = id.0, cards = removed, "collection deleted");
        Ok(true)
    }

    /// Bumps the play counter; `None` if the collection does not exist.
    pub fn increment_play_count(&self, id: CollectionId) -> Result<Option<u64>, StorageError> {
        let key = id_key(id.0);
        let label = format!("collections/{}", id.0);
        loop {
            let Some(current) = self.collections.get(key)? else {
                return Ok(None);
            };
            let mut collection: Collection = decode(&label, &current)?;
            collection.play_count += 1;
            let next = serde_json::to_vec(&collection)?;
            if self
                .collections
                .compare_and_swap(key, Some(current), Some(next))?
                .is_ok()
            {
                return Ok(Some(collection.play_count));
            }
        }
    }

    // --- Actions (cards) ---

    /// Writes the card and its parent link in one transaction, only while the
    /// parent collection still exists. `None` means the collection is gone.
    fn insert_action(
        &self,
        collection: CollectionId,
        new: NewAction,
        existing: usize,
    ) -> Result<Option<Action>, StorageError> {
        let now = Utc::now();
        let order = if new.order == 0 {
            u32::try_from(existing + 1).unwrap_or(u32::MAX)
        } else {
            new.order
        };
        let action = Action {
            id: ActionId(self.next_id()?),
            collection_id: collection,
            text: new.text,
            kind: new.kind,
            order,
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_vec(&action)?;
        let parent_key = id_key(collection.0);
        let card_key = action_key(collection, action.id);
        let link_key = id_key(action.id.0);

        let written = (&self.collections, &self.actions, &self.action_parents)
            .transaction(
                |(collections, actions, parents)| -> ConflictableTransactionResult<bool, Infallible> {
                    if collections.get(&parent_key[..])?.is_none() {
                        return Ok(false);
                    }
                    actions.insert(&card_key[..], value.clone())?;
                    parents.insert(&link_key[..], &parent_key[..])?;
                    Ok(true)
                },
            )
            .map_err(tx_error)?;
        Ok(written.then_some(action))
    }

    /// `None` if the collection was deleted after the grant was issued.
    pub fn add_action(
        &self,
        grant: &Authorized<CollectionId>,
        new: NewAction,
    ) -> Result<Option<Action>, StorageError> {
        let collection = grant.resource();
        let existing = self.actions.scan_prefix(id_key(collection.0)).count();
        let action = self.insert_action(collection, new, existing)?;
        match &action {
            Some(action) => debug!(collection_id = collection.0, action_id = action.id.0, "card added"),
            None => debug!(collection_id = collection.0, "card dropped: collection gone"),
        }
        Ok(action)
    }

    /// Cards of a collection ordered by their position.
    pub fn actions_of(&self, collection: CollectionId) -> Result<Vec<Action>, StorageError> {
        let mut actions = vec![];
        for item in self.actions.scan_prefix(id_key(collection.0)) {
            let (key, value) = item?;
            actions.push(decode::<Action>(&format!("actions/{:?}", key), &value)?);
        }
        actions.sort_by_key(|a| (a.order, a.id.0));
        Ok(actions)
    }

    pub fn action_parent(&self, id: ActionId) -> Result<Option<CollectionId>, StorageError> {
        match self.action_parents.get(id_key(id.0))? {
            Some(raw) => Ok(Some(CollectionId(decode_id("action_parents", &raw)?))),
            None => Ok(None),
        }
    }

    pub fn find_action(&self, id: ActionId) -> Result<Option<Action>, StorageError> {
        let Some(parent) = self.action_parent(id)? else {
            return Ok(None);
        };
        get_json(&self.actions, &format!("actions/{}", id.0), &action_key(parent, id))
    }

    pub fn remove_action(&self, grant: &Authorized<ActionId>) -> Result<bool, StorageError> {
        let id = grant.resource();
        let Some(parent) = self.action_parent(id)? else {
            return Ok(false);
        };
        let removed: Option<IVec> = self.actions.remove(action_key(parent, id))?;
        self.action_parents.remove(id_key(id.0))?;
        Ok(removed.is_some())
    }

    pub fn action_counts(&self, collection: CollectionId) -> Result<ActionCounts, StorageError> {
        let mut counts = ActionCounts::default();
        for action in self.actions_of(collection)? {
            counts.total_actions += 1;
            match action.kind {
                ActionType::Truth => counts.truth_count += 1,
                ActionType::Dare => counts.dare_count += 1,
            }
        }
        Ok(counts)
    }

    /// Overwrites a raw card record. Only used to simulate damaged data.
    #[cfg(test)]
    pub(crate) fn put_raw_action(
        &self,
        collection: CollectionId,
        id: ActionId,
        raw: &serde_json::Value,
    ) -> Result<(), StorageError> {
        put_json(&self.actions, &action_key(collection, id), raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::authz::Authorized;

    pub(crate) fn temp_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("temp dir");
        let storage = Storage::open(dir.path().join("db")).expect("open storage");
        (dir, storage)
    }

    pub(crate) fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Ann".to_string(),
            surname: "Lee".to_string(),
            email: email.to_string(),
            password_hash: "$2b$04$placeholder".to_string(),
            phone: String::new(),
        }
    }

    pub(crate) fn new_collection(name: &str) -> NewCollection {
        NewCollection {
            name: name.to_string(),
            description: "party pack".to_string(),
            image_url: String::new(),
        }
    }

    fn card(text: &str, kind: ActionType) -> NewAction {
        NewAction {
            text: text.to_string(),
            kind,
            order: 0,
        }
    }

    #[test]
    fn users_by_id_and_email() {
        let (_dir, storage) = temp_storage();
        let user = storage.create_user(new_user("a@x.com")).unwrap();
        assert_ne!(user.id, 0);

        let by_id = storage.find_user_by_id(user.id).unwrap().unwrap();
        assert_eq!(by_id.email, "a@x.com");
        let by_email = storage.find_user_by_email("a@x.com").unwrap().unwrap();
        assert_eq!(by_email.id, user.id);

        assert!(storage.find_user_by_id(user.id + 100).unwrap().is_none());
        assert!(storage.find_user_by_email("nobody@x.com").unwrap().is_none());
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let (_dir, storage) = temp_storage();
        storage.create_user(new_user("a@x.com")).unwrap();
        assert!(matches!(
            storage.create_user(new_user("a@x.com")),
            Err(StorageError::EmailTaken)
        ));
    }

    #[test]
    fn email_change_moves_the_index() {
        let (_dir, storage) = temp_storage();
        let mut user = storage.create_user(new_user("old@x.com")).unwrap();
        storage.create_user(new_user("taken@x.com")).unwrap();

        user.email = "taken@x.com".to_string();
        assert!(matches!(storage.update_user(&user), Err(StorageError::EmailTaken)));

        user.email = "new@x.com".to_string();
        storage.update_user(&user).unwrap().unwrap();
        assert!(storage.find_user_by_email("old@x.com").unwrap().is_none());
        assert_eq!(storage.find_user_by_email("new@x.com").unwrap().unwrap().id, user.id);
    }

    #[test]
    fn collection_crud_and_cascade() {
        let (_dir, storage) = temp_storage();
        let (collection, actions) = storage
            .create_collection_with_actions(
                1,
                new_collection("Friday"),
                vec![card("Who was your first crush?", ActionType::Truth), card("Dance", ActionType::Dare)],
            )
            .unwrap();
        assert_eq!(actions[0].order, 1);
        assert_eq!(actions[1].order, 2);
        assert_eq!(collection.user_id, 1);

        let grant = Authorized::for_tests(collection.id);
        let updated = storage
            .update_collection(
                &grant,
                CollectionPatch {
                    name: "Saturday".to_string(),
                    description: String::new(),
                    image_url: String::new(),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Saturday");
        assert_eq!(updated.user_id, 1);

        let counts = storage.action_counts(collection.id).unwrap();
        assert_eq!(counts, ActionCounts { total_actions: 2, truth_count: 1, dare_count: 1 });

        assert!(storage.delete_collection(&grant).unwrap());
        assert!(storage.find_collection(collection.id).unwrap().is_none());
        assert!(storage.find_action(actions[0].id).unwrap().is_none());
        assert!(!storage.delete_collection(&grant).unwrap());
    }

    #[test]
    fn listing_paging_and_trending() {
        let (_dir, storage) = temp_storage();
        let ids: Vec<CollectionId> = (0..5)
            .map(|i| storage.create_collection(i % 2, new_collection(&format!("c{}", i))).unwrap().id)
            .collect();

        let page = storage.list_collections(2, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, ids[2]);

        assert_eq!(storage.collections_by_user(1).unwrap().len(), 2);

        for _ in 0..3 {
            storage.increment_play_count(ids[1]).unwrap();
        }
        assert_eq!(storage.increment_play_count(ids[0]).unwrap(), Some(1));
        assert_eq!(storage.increment_play_count(CollectionId(9_999)).unwrap(), None);

        let trending = storage.trending_collections(2).unwrap();
        assert_eq!(trending[0].id, ids[1]);
        assert_eq!(trending[1].id, ids[0]);
    }

    #[test]
    fn cards_keep_explicit_order_and_can_be_removed() {
        let (_dir, storage) = temp_storage();
        let collection = storage.create_collection(1, new_collection("c")).unwrap();
        let grant = Authorized::for_tests(collection.id);
        let last = storage
            .add_action(&grant, NewAction { text: "last".to_string(), kind: ActionType::Dare, order: 10 })
            .unwrap()
            .unwrap();
        let first = storage.add_action(&grant, card("first", ActionType::Truth)).unwrap().unwrap();
        assert_eq!(first.order, 2);

        let listed = storage.actions_of(collection.id).unwrap();
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![first.id, last.id]);
        assert_eq!(storage.action_parent(first.id).unwrap(), Some(collection.id));

        assert!(storage.remove_action(&Authorized::for_tests(first.id)).unwrap());
        assert!(storage.find_action(first.id).unwrap().is_none());
        assert_eq!(storage.actions_of(collection.id).unwrap().len(), 1);
    }

    #[test]
    fn card_added_after_delete_writes_nothing() {
        let (_dir, storage) = temp_storage();
        let collection = storage.create_collection(1, new_collection("short-lived")).unwrap();
        let add_grant = Authorized::for_tests(collection.id);
        let delete_grant = Authorized::for_tests(collection.id);

        assert!(storage.delete_collection(&delete_grant).unwrap());
        assert!(storage.add_action(&add_grant, card("late", ActionType::Dare)).unwrap().is_none());

        assert!(storage.find_collection(collection.id).unwrap().is_none());
        assert!(storage.actions_of(collection.id).unwrap().is_empty());
        assert_eq!(storage.action_parents.len(), 0);
        assert_eq!(storage.actions.len(), 0);
    }

    #[test]
    fn far_page_does_not_overflow() {
        let (_dir, storage) = temp_storage();
        storage.create_collection(1, new_collection("only")).unwrap();
        let page = storage.list_collections(usize::MAX, 100).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 1);
    }

    #[test]
    fn corrupted_category_surfaces_as_error() {
        let (_dir, storage) = temp_storage();
        let collection = storage.create_collection(1, new_collection("c")).unwrap();
        let grant = Authorized::for_tests(collection.id);
        let action = storage.add_action(&grant, card("ok", ActionType::Truth)).unwrap().unwrap();

        let mut raw = serde_json::to_value(&action).unwrap();
        raw["type"] = serde_json::json!("mystery");
        storage.put_raw_action(collection.id, action.id, &raw).unwrap();

        assert!(matches!(storage.actions_of(collection.id), Err(StorageError::Corrupt { .. })));
        assert!(matches!(storage.action_counts(collection.id), Err(StorageError::Corrupt { .. })));
    }
}
