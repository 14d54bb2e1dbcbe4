#![allow(dead_code)]

use rusty_chain::trainer::Data;

use std::path::PathBuf;

pub fn xor_data() -> Vec<Data> {
    vec![
        Data::new([0., 0.], [0.]),
        Data::new([0., 1.], [1.]),
        Data::new([1., 0.], [1.]),
        Data::new([1., 1.], [0.]),
    ]
}

/// A file in the system temp directory unique to this test process.
pub fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rusty_chain_{}_{}.json", std::process::id(), name))
}

pub fn assert_close(left: &[f64], right: &[f64]) {
    assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(right) {
        approx::assert_relative_eq!(l, r, epsilon = 1e-12, max_relative = 1e-12);
    }
}
