#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod basis;
pub mod config;
pub mod covariates;
pub mod data;
pub mod density;
pub mod design;
pub mod multi_index;
pub mod pipeline;
pub mod posterior;
pub mod predictive;
pub mod sampler;
