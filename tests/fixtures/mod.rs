#![allow(dead_code)]

pub mod daemon_runtime;
