use std::{collections::HashMap, fmt, hash::Hasher, sync::Arc};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(u64);

/// Interned symbol or type name. Equality is by id.
#[derive(Clone)]
pub struct Name {
    id: NameId,
    value: Arc<str>,
}

impl Name {
    pub fn id(&self) -> NameId {
        self.id
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Name {}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.value)
    }
}

struct NamePoolImpl {
    table: HashMap<NameId, Arc<str>, ahash::RandomState>,
    mappings: HashMap<Arc<str>, NameId, ahash::RandomState>,
}

impl NamePoolImpl {
    fn new() -> Self {
        Self {
            table: HashMap::default(),
            mappings: HashMap::default(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> Name {
        if let Some(&id) = self.mappings.get(value) {
            let value = self.table[&id].clone();
            return Name { id, value };
        }
        let mut hasher = ahash::AHasher::default();
        hasher.write(value.as_bytes());
        let mut hash = hasher.finish();
        // probe past the rare collision
        while self.table.contains_key(&NameId(hash)) {
            hash = hash.wrapping_add(1);
        }
        let id = NameId(hash);
        let interned = Arc::<str>::from(value);
        self.mappings.insert(interned.clone(), id);
        self.table.insert(id, interned.clone());
        Name {
            id,
            value: interned,
        }
    }

    fn get(&self, id: NameId) -> Option<Name> {
        Some(Name {
            id,
            value: self.table.get(&id)?.clone(),
        })
    }
}

/// Process-wide name table shared by a context and its threads.
#[derive(Clone)]
pub struct NamePool(Arc<RwLock<NamePoolImpl>>);

impl NamePool {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(NamePoolImpl::new())))
    }

    pub fn intern(&self, value: &str) -> Name {
        {
            let pool = self.0.read();
            if let Some(name) = pool.mappings.get(value).and_then(|&id| pool.get(id)) {
                return name;
            }
        }
        self.0.write().get_or_add(value)
    }

    pub fn get(&self, id: NameId) -> Option<Name> {
        self.0.read().get(id)
    }

    pub fn len(&self) -> usize {
        self.0.read().table.len()
    }
}

impl Default for NamePool {
    fn default() -> Self {
        Self::new()
    }
}
