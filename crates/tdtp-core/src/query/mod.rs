//! TDTQL: the TDTP query sub-language.
//!
//! A small SQL subset (single-table SELECT with a filter tree, ordering
//! and pagination) with three consumers: adapters push it down as SQL
//! when the dialect can take it, the in-memory executor runs it over
//! cached packet rows, and response packets carry it inside their query
//! context.

pub mod ast;
pub mod executor;
pub mod lexer;
pub mod parser;
pub mod sqlgen;

pub use ast::{CompareOp, Expr, Filter, OrderBy, SelectStatement, SortDirection};
pub use executor::{execute, ExecutionOutcome};
pub use parser::parse;
pub use sqlgen::{can_translate, to_sql};
