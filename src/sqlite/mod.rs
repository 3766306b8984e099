// rusqlite binding for the capability traits
//
// - connection: engine, connection handle, statement registry (leak detection)
// - statement: live compiled statement, cursor position and bindings for one query
// - values: conversion between crate values and rusqlite values

mod connection;
mod statement;
mod values;

pub use connection::{RusqliteEngine, SqliteConnection};
pub use statement::SqliteStatement;
