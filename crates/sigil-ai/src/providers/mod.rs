//! Provider implementations

pub mod openai_compat;
