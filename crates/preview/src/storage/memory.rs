use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::StoreError;
use crate::model::Record;
use crate::storage::Storage;

type Slot = Arc<Mutex<Option<Record>>>;

/// In-process storage. Each key has its own lock, so the map lock is only
/// held while a slot is looked up or inserted.
#[derive(Default)]
pub struct MemoryStorage {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Result<Slot, StoreError> {
        {
            let slots = self.slots.read().map_err(|_| StoreError::LockPoisoned)?;
            if let Some(slot) = slots.get(key) {
                return Ok(Arc::clone(slot));
            }
        }
        let mut slots = self.slots.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        ))
    }

    fn existing_slot(&self, key: &str) -> Result<Option<Slot>, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(slots.get(key).cloned())
    }
}

impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put(&self, key: &str, record: Record) -> Result<(), StoreError> {
        let slot = self.slot(key)?;
        let mut value = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
        *value = Some(record);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        match self.existing_slot(key)? {
            Some(slot) => {
                let value = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
                Ok(value.clone())
            }
            None => Ok(None),
        }
    }

    fn list(&self, predicate: &dyn Fn(&Record) -> bool) -> Result<Vec<Record>, StoreError> {
        let snapshot: Vec<(String, Slot)> = {
            let slots = self.slots.read().map_err(|_| StoreError::LockPoisoned)?;
            slots
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        let mut keyed = Vec::new();
        for (key, slot) in snapshot {
            let value = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
            if let Some(record) = value.as_ref() {
                if predicate(record) {
                    keyed.push((key, record.clone()));
                }
            }
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(keyed.into_iter().map(|(_, record)| record).collect())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&Record>) -> Option<Record>,
    ) -> Result<bool, StoreError> {
        let slot = self.slot(key)?;
        let mut value = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
        match apply(value.as_ref()) {
            Some(next) => {
                *value = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
