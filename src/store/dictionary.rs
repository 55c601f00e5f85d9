use std::collections::HashMap;
use std::sync::RwLock;

use super::ProductId;

/// Persistable copy of the dictionary: the next id to hand out and every
/// `(name, id)` pair in id order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DictionarySnapshot {
    pub next_id: ProductId,
    pub entries: Vec<(String, ProductId)>,
}

#[derive(Default)]
struct DictionaryState {
    ids: HashMap<String, ProductId>,
    names: HashMap<ProductId, String>,
    next_id: ProductId,
}

/// Append-only `name <-> id` mapping. Ids are never reused or renamed.
#[derive(Default)]
pub struct ProductDictionary {
    state: RwLock<DictionaryState>,
}

impl ProductDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DictionarySnapshot) -> Self {
        let mut state = DictionaryState {
            next_id: snapshot.next_id,
            ..DictionaryState::default()
        };
        for (name, id) in snapshot.entries {
            state.next_id = state.next_id.max(id.saturating_add(1));
            state.names.insert(id, name.clone());
            state.ids.insert(name, id);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Resolves `name`, assigning the next id if it was never seen.
    pub fn get_or_create(&self, name: &str) -> ProductId {
        if let Some(id) = self.id_of(name) {
            return id;
        }

        let mut state = self.state.write().expect("dictionary lock poisoned");
        if let Some(id) = state.ids.get(name) {
            return *id;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.ids.insert(name.to_owned(), id);
        state.names.insert(id, name.to_owned());
        id
    }

    pub fn id_of(&self, name: &str) -> Option<ProductId> {
        self.state
            .read()
            .expect("dictionary lock poisoned")
            .ids
            .get(name)
            .copied()
    }

    pub fn name_of(&self, id: ProductId) -> Option<String> {
        self.state
            .read()
            .expect("dictionary lock poisoned")
            .names
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("dictionary lock poisoned").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> DictionarySnapshot {
        let state = self.state.read().expect("dictionary lock poisoned");
        let mut entries: Vec<(String, ProductId)> = state
            .ids
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        entries.sort_by_key(|(_, id)| *id);
        DictionarySnapshot {
            next_id: state.next_id,
            entries,
        }
    }
}
