#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod checksum;
mod translate;

pub use translate::{Translator, TranslatorError};
