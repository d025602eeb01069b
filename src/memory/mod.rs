pub mod allocator;
pub(crate) mod chunk;
pub mod general;
pub mod linear;
pub(crate) mod loom_tests;
pub mod pool;
pub(crate) mod space;
pub(crate) mod stats;
pub mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
