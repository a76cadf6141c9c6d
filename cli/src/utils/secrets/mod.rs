pub mod master_key;
pub mod master_key_provider;
