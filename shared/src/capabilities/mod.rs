mod http;
mod identity;
mod kv;

pub use self::http::{parse_saved_ids, HttpError, PropertySubmitter, SavedPropertiesApi};
pub use self::identity::{IdentityProvider, Session, SessionIdentity};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKv, StorageErrorCode, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;
