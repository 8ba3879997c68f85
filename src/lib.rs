#![doc = include_str!("../README.md")]

pub use ember_jobs as jobs;
