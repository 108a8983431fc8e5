pub mod catalog;
pub mod deny;
pub mod inventory;
pub mod prune;
pub mod rebuild;
pub mod serve;
pub mod submit;
