pub mod command;
pub mod counts;
pub mod downsample;
pub mod file;
pub mod fragments;
pub mod intervals;
pub mod matrix;
pub mod region_caller;
pub mod regions;
pub mod streams;
pub mod system;
