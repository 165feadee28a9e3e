//! A `select` method for [`bool`] and [`Option`].

/// Consumes two inputs and returns one of them based on the value of the
/// selector.
pub(crate) trait Select {
    /// Selects one of two values.
    fn select_val<T>(&self, a: T, b: T) -> T;

    /// Selects one of two values, lazily evaluated.
    fn select<T>(&self, a: impl FnOnce() -> T, b: impl FnOnce() -> T) -> T;
}

impl Select for bool {
    #[inline(always)]
    fn select_val<T>(&self, a: T, b: T) -> T {
        if *self {
            a
        } else {
            b
        }
    }

    #[inline(always)]
    fn select<T>(&self, a: impl FnOnce() -> T, b: impl FnOnce() -> T) -> T {
        if *self {
            a()
        } else {
            b()
        }
    }
}

impl<T> Select for Option<T> {
    #[inline(always)]
    fn select_val<U>(&self, a: U, b: U) -> U {
        self.is_some().select_val(a, b)
    }

    #[inline(always)]
    fn select<U>(&self, a: impl FnOnce() -> U, b: impl FnOnce() -> U) -> U {
        self.is_some().select(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_on_bool_and_option() {
        assert_eq!(true.select_val(1, 2), 1);
        assert_eq!(false.select(|| "a", || "b"), "b");
        assert_eq!(Some(3).select_val('x', 'y'), 'x');
        assert_eq!(None::<u8>.select(|| 1, || 0), 0);
    }
}
