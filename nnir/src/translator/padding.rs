use super::model::Padding;

/// Front and back padding of one spatial dimension.
///
/// `Same` padding keeps `ceil(input / stride)` output positions, with the dilated kernel
/// `kernel + (dilation - 1) * (kernel - 1)`. When the padding is odd the extra element goes
/// to the back. `Valid` padding never pads. Returns `None` when the padded extent does not
/// fit in 32 bits.
pub fn calc_padding(
    input: u32,
    kernel: u32,
    stride: u32,
    dilation: u32,
    padding: Padding,
) -> Option<(u32, u32)> {
    match padding {
        Padding::Valid => Some((0, 0)),
        Padding::Same => {
            let stride = stride.max(1);
            let output = input.div_ceil(stride);
            let dilated = dilation
                .saturating_sub(1)
                .checked_mul(kernel.saturating_sub(1))?
                .checked_add(kernel)?;
            let needed = output
                .saturating_sub(1)
                .checked_mul(stride)?
                .checked_add(dilated)?
                .saturating_sub(input);
            let front = needed / 2;
            Some((front, needed - front))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::odd_input(7, 3, 2, 1, Some((1, 1)))]
    #[case::unit_stride(5, 3, 1, 1, Some((1, 1)))]
    #[case::back_gets_the_extra(8, 3, 2, 1, Some((0, 1)))]
    #[case::even_kernel(4, 2, 1, 1, Some((0, 1)))]
    #[case::dilated(7, 3, 1, 2, Some((2, 2)))]
    #[case::kernel_within_stride(6, 1, 2, 1, Some((0, 0)))]
    #[case::huge_dilation(7, 3, 1, u32::MAX, None)]
    #[case::huge_stride(u32::MAX, 3, u32::MAX / 2, 1, None)]
    #[case::huge_kernel(7, u32::MAX, 2, 1, None)]
    fn test_same_padding(
        #[case] input: u32,
        #[case] kernel: u32,
        #[case] stride: u32,
        #[case] dilation: u32,
        #[case] expected: Option<(u32, u32)>,
    ) {
        assert_eq!(
            calc_padding(input, kernel, stride, dilation, Padding::Same),
            expected
        );
    }

    #[test]
    fn test_valid_padding() {
        assert_eq!(calc_padding(7, 3, 2, 1, Padding::Valid), Some((0, 0)));
    }
}
