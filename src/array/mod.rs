//! Array model: schema, attributes, datatypes and domain arithmetic

pub mod domain;
pub mod schema;

pub use domain::DomainValue;
pub use schema::{ArraySchema, Attribute, Datatype, Layout, COORDS};
