use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(ItemId);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored shopping-list entry. `id` is assigned by the store on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingItem {
    pub id: ItemId,
    pub name: String,
    #[serde(default)]
    pub is_bought: bool,
}

impl ShoppingItem {
    pub fn toggled(&self) -> Self {
        Self {
            is_bought: !self.is_bought,
            ..self.clone()
        }
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// An item that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    #[serde(default)]
    pub is_bought: bool,
}

impl NewItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_bought: false,
        }
    }

    pub fn with_id(self, id: ItemId) -> ShoppingItem {
        ShoppingItem {
            id,
            name: self.name,
            is_bought: self.is_bought,
        }
    }
}

/// Trims `raw` and returns `None` when nothing is left.
pub fn normalize_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn bought_count(items: &[ShoppingItem]) -> usize {
    items.iter().filter(|item| item.is_bought).count()
}
