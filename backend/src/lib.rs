//! doclib library
//!
//! Backend of a document library: accounts with an internal wallet, paid
//! document and file downloads, moderation of uploaded content, comments,
//! ratings and an activity trail. The binary only wires these together.

pub mod app;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod services;
pub mod storage;

#[cfg(test)]
mod test_support;
