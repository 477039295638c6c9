/// Round up `n` to the nearest multiple of `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Round down `n` to the nearest multiple of `to`
pub fn round_down(n: usize, to: usize) -> usize {
    n - n % to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    pub fn round_down_computes_correctly() {
        assert_eq!(round_down(0, 64), 0);
        assert_eq!(round_down(63, 64), 0);
        assert_eq!(round_down(64, 64), 64);
        assert_eq!(round_down(130, 64), 128);
    }
}
