pub mod extendible_hash;
