pub mod engine;
pub mod entity;
pub mod error;
pub mod evaluator;
pub mod ruleset;
pub mod skip;
pub mod table;
