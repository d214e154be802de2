pub mod args;
pub mod broker;
pub mod peer;
pub mod report;
