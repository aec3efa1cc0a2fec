// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::path::Path;
use wildsort::predictions::PredictionSet;

fuzz_target!(|data: &[u8]| {
    if let Ok(set) = PredictionSet::from_slice(data, Path::new("/fuzz")) {
        for record in set.records() {
            let _ = record.common_name();
            assert!(record.top_score.map_or(true, |s| (0.0..=1.0).contains(&s)));
        }
    }
});
