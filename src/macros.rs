#[macro_export]
macro_rules! unsigned_ceil_div {
    ($numerator:expr, $denominator:expr) => {{
        let numerator = $numerator;
        if numerator == 0 {
            0
        } else {
            1 + ((numerator - 1) / $denominator)
        }
    }};
}

#[macro_export]
macro_rules! ok_or_missing_field {
    ($field:expr) => {
        $field.ok_or_else(|| bendy::decoding::Error::missing_field(stringify!($field)))
    };
    ($field:expr,$field_name:expr) => {
        $field.ok_or_else(|| bendy::decoding::Error::missing_field($field_name))
    };
}

#[macro_export]
macro_rules! u32_from_be_slice {
    ($slice:expr) => {
        (($slice[0] as u32) << 24)
            + (($slice[1] as u32) << 16)
            + (($slice[2] as u32) << 8)
            + ($slice[3] as u32)
    };
}

/// Lock a `std::sync::Mutex`, recovering the guard if a holder panicked.
#[macro_export]
macro_rules! lock {
    ($mutex:expr) => {
        $mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn ceil_div() {
        assert_eq!(0, unsigned_ceil_div!(0usize, 8));
        assert_eq!(1, unsigned_ceil_div!(1usize, 8));
        assert_eq!(1, unsigned_ceil_div!(8usize, 8));
        assert_eq!(3, unsigned_ceil_div!(1_126_400u64, 524_288));
    }

    #[test]
    fn be_slice() {
        let raw = 726049813u32.to_be_bytes();
        assert_eq!(726049813, u32_from_be_slice!(raw));
    }
}
