pub(crate) mod allocator;
pub(crate) mod attempt;
pub(crate) mod chunk;
pub(crate) mod error;
pub(crate) mod handle;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod region;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
