//! Lock-bound, audited writes into Schedule of Values workbooks.
//!
//! A template lock pins the exact template bytes and the columns and rows
//! that may be written. A write plan is validated against the lock and
//! applied to a copy of the template, one audited cell at a time.
pub mod address;
pub mod apply;
pub mod batch;
pub mod cli;
pub mod commands;
pub mod discovery;
pub mod error;
pub mod lock;
pub mod plan;
pub mod util;
pub mod validate;
pub mod workbook;
pub mod writer;

#[cfg(test)]
mod test_support;
