pub mod bucket;
pub mod directory;

// numeric keys are 4 bytes, same as the table key type
pub type Key = u32;
