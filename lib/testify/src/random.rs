use rand::distr::Alphanumeric;
use rand::{Rng, rng};

pub fn random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Endless `sequence,payload` lines, unique and without line breaks.
pub fn random_lines(len: usize) -> impl Iterator<Item = String> {
    (0u64..).map(move |seq| format!("{seq:06},{}", random_string(len)))
}
