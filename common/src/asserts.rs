/// Asserts that `value` is no further than `tolerance` from `expected`.
macro_rules! assert_near {
    ($value:expr, $expected:expr, $tolerance:expr) => {{
        let value = $value;
        let expected = $expected;
        let tolerance = $tolerance;
        if value > expected + tolerance || value + tolerance < expected {
            panic!("value {} is not within {} of {}", value, tolerance, expected);
        }
    }};
}
