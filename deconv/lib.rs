#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod confint;
pub mod data;
pub mod engine;
pub mod kernel;
pub mod regress;
