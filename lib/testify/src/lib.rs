pub mod fs;
pub mod random;
pub mod wait;
