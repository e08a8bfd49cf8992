//! Core of tfrelay: terraform step execution, variables-file rewriting and
//! the catalogue of workflows exposed over HTTP and the CLI.

pub mod exec;
pub mod layout;
pub mod tfvars;
pub mod workflow;
