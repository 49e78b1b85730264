// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Typed accessors.
//
// serde-based convenience methods on root and scoped storage. Values are
// converted to and from `serde_json::Value`; conversion failures surface as
// `StorageError::Serialization`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use nestkv_container::Result;

use crate::root::RootStorage;
use crate::scoped::ScopedStorage;

fn decode<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<T>> {
    value
        .map(|v| serde_json::from_value(v).map_err(Into::into))
        .transpose()
}

impl RootStorage {
    /// Read `key` and deserialize it.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        decode(self.get_item(key).await?)
    }

    /// Serialize `value` and store it at `key`.
    pub async fn set_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_item(key, serde_json::to_value(value)?).await
    }
}

impl ScopedStorage {
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        decode(self.get_item(key).await?)
    }

    pub async fn set_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_item(key, serde_json::to_value(value)?).await
    }

    /// The whole scope object as `T`, or `None` when the scope has no object.
    pub async fn get_all_typed<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode(self.get_all().await?.map(Value::Object))
    }
}
