use std::sync::Arc;

use easy_ext::ext;

#[ext(ArcExt)]
pub impl<T: ?Sized> Arc<T> {
    /// Named clone for `Arc`s to make the cheapness of the copy explicit at call sites.
    #[must_use]
    fn clone_arc(&self) -> Self {
        Self::clone(self)
    }
}

#[ext(CopyExt)]
pub impl<T: Copy> T {
    #[must_use]
    fn copy(&self) -> Self {
        *self
    }
}
