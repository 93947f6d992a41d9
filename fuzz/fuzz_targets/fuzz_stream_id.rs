// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for stream id / position parsing.
//!
//! Parsing never panics, and any id that parses renders back to an id that
//! parses to the same position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_connector::redis_oplog::parse_stream_id;
use oplog_connector::Position;

fuzz_target!(|data: &str| {
    if let Ok(position) = parse_stream_id(data) {
        let rendered = position.to_string();
        assert_eq!(rendered.parse::<Position>().ok(), Some(position));
    }
    let _ = data.parse::<Position>();
});
