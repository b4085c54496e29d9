//! Readers for kernel-published sysfs attributes.

pub mod block;
