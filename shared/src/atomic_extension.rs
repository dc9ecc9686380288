use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub trait AtomicExtension {
    type T;
    fn load_acquire(&self) -> Self::T;
    fn store_release(&self, val: Self::T);
    /// Acquire-release compare-exchange, returning whether `current` was
    /// replaced by `new`.
    fn transition(&self, current: Self::T, new: Self::T) -> bool;
}

macro_rules! impl_atomic_extension {
    ($t:ty, $atomicType: ty) => {
        impl AtomicExtension for $atomicType {
            type T = $t;
            fn load_acquire(&self) -> $t {
                self.load(Ordering::Acquire)
            }
            fn store_release(&self, val: $t) {
                self.store(val, Ordering::Release);
            }
            fn transition(&self, current: $t, new: $t) -> bool {
                self.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
        }
    };
}

impl_atomic_extension!(u8, AtomicU8);
impl_atomic_extension!(u64, AtomicU64);
