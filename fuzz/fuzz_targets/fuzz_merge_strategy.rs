// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for initializer merge strategies

#![no_main]

use libfuzzer_sys::fuzz_target;
use nestkv::InitializerStrategy;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    // Split the input into a default document and an existing document
    let Some(split) = data.iter().position(|&b| b == 0) else {
        return;
    };
    let (Ok(default), Ok(existing)) = (
        serde_json::from_slice::<Value>(&data[..split]),
        serde_json::from_slice::<Value>(&data[split + 1..]),
    ) else {
        return;
    };

    let kept = InitializerStrategy::existing_wins().merge(default.clone(), existing.clone());
    let forced = InitializerStrategy::defaults_win().merge(default.clone(), existing.clone());

    // Every top-level field of the winning side survives unchanged
    if let (Value::Object(_), Value::Object(existing)) = (&default, &existing) {
        for (key, value) in existing {
            assert_eq!(kept.get(key), Some(value));
        }
    }
    if let (Value::Object(default), Value::Object(_)) = (&default, &existing) {
        for (key, value) in default {
            assert_eq!(forced.get(key), Some(value));
        }
    }
});
