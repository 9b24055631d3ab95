//! Terminal display utilities for the CLI: styled messages and tables.

pub mod tables;
pub mod theme;

pub use tables::{TableBuilder, create_health_table, create_import_table, create_results_table};
pub use theme::{THEME, Theme};
