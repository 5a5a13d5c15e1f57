pub mod serde_millis;
