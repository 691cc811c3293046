#![allow(dead_code)]

pub mod rig;
