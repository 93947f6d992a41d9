// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for lag calculation.
//!
//! `lag_ms` never panics and is zero when the applied position is not
//! behind the read position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_connector::oplog::lag_ms;
use oplog_connector::Position;

fuzz_target!(|data: (u64, u64, u64, u64)| {
    let applied = Position::new(data.0, data.1);
    let read = Position::new(data.2, data.3);

    let lag = lag_ms(applied, read);
    if applied.ts >= read.ts {
        assert_eq!(lag, 0);
    }
});
