pub mod daemon;
pub mod filesystem;
pub mod object;
pub mod refresh;
pub mod version;
