// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for oplog stream entry decoding.
//!
//! Arbitrary field values must decode or fail with an error, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_connector::redis_oplog::parse_entry;
use std::collections::HashMap;

fuzz_target!(|data: (&str, &str, &str, &str, &str)| {
    let (stream_id, ns, op, id, doc) = data;
    let mut fields = HashMap::new();
    fields.insert("ns".to_string(), ns.to_string());
    fields.insert("op".to_string(), op.to_string());
    fields.insert("id".to_string(), id.to_string());
    fields.insert("doc".to_string(), doc.to_string());

    if let Ok(event) = parse_entry(stream_id, &fields) {
        assert_eq!(event.namespace, ns);
    }
});
