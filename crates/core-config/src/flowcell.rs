//! Physical flow-cell layout and region splitting.
//!
//! Channels are laid out on a fixed 2-D grid per device size and regions are
//! assigned by cutting that grid into equal blocks along one axis, so every
//! region is a contiguous geometric block of pores rather than an arbitrary
//! channel list. Documented grids:
//!
//! - 126 channels: 10 rows x 13 columns, row-major, last four cells empty.
//! - 512 channels: 16 rows x 32 columns, row-major.
//! - 3000 channels: 25 rows x 120 columns, in twelve blocks of 250 channels
//!   (10 columns per block).
//!
//! Any other channel count is a configuration error.

use crate::ConfigError;

/// Axis along which the grid is cut into region blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitAxis {
    /// Cut into vertical stripes (blocks of columns).
    #[default]
    Columns,
    /// Cut into horizontal stripes (blocks of rows).
    Rows,
}

/// Grid shape `(rows, columns)` for a recognised flow-cell size.
pub fn grid_shape(channels: usize) -> Result<(usize, usize), ConfigError> {
    match channels {
        126 => Ok((10, 13)),
        512 => Ok((16, 32)),
        3000 => Ok((25, 120)),
        other => Err(ConfigError::UnknownFlowcell(other)),
    }
}

/// Grid coordinates `(row, column)` of a channel. Channels are 1-based.
pub fn channel_coords(channel: usize, channels: usize) -> Result<(usize, usize), ConfigError> {
    if channel == 0 || channel > channels {
        return Err(ConfigError::ChannelOutOfRange { channel, channels });
    }
    match channels {
        3000 => {
            let block = (channel - 1) / 250;
            let rem = (channel - 1) % 250;
            Ok((rem / 10, rem % 10 + block * 10))
        }
        126 | 512 => {
            let (_, cols) = grid_shape(channels)?;
            Ok(((channel - 1) / cols, (channel - 1) % cols))
        }
        other => Err(ConfigError::UnknownFlowcell(other)),
    }
}

/// Positive divisors of `n`, ascending.
fn divisors(n: usize) -> Vec<usize> {
    (1..=n).filter(|d| n % d == 0).collect()
}

/// Region index (block number) of every channel when the grid is cut into
/// `split` equal blocks along `axis`. Returned vector is indexed by channel
/// number; index 0 is unused.
pub fn channel_regions(
    channels: usize,
    split: usize,
    axis: SplitAxis,
) -> Result<Vec<usize>, ConfigError> {
    let (rows, cols) = grid_shape(channels)?;
    if split == 0 {
        return Err(ConfigError::UnevenSplit {
            split,
            axis_len: cols,
            divisors: divisors(cols),
        });
    }
    let axis_len = match axis {
        SplitAxis::Columns => cols,
        SplitAxis::Rows => rows,
    };
    if axis_len % split != 0 {
        return Err(ConfigError::UnevenSplit {
            split,
            axis_len,
            divisors: divisors(axis_len),
        });
    }
    let block_len = axis_len / split;
    let mut map = vec![0usize; channels + 1];
    for channel in 1..=channels {
        let (row, col) = channel_coords(channel, channels)?;
        let position = match axis {
            SplitAxis::Columns => col,
            SplitAxis::Rows => row,
        };
        map[channel] = position / block_len;
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_grid_shapes() {
        assert_eq!(grid_shape(126).unwrap(), (10, 13));
        assert_eq!(grid_shape(512).unwrap(), (16, 32));
        assert_eq!(grid_shape(3000).unwrap(), (25, 120));
        assert!(matches!(
            grid_shape(128),
            Err(ConfigError::UnknownFlowcell(128))
        ));
    }

    #[test]
    fn promethion_coords_follow_block_layout() {
        // First channel of the second block of 250 sits at column 10.
        assert_eq!(channel_coords(251, 3000).unwrap(), (0, 10));
        assert_eq!(channel_coords(1, 3000).unwrap(), (0, 0));
        assert_eq!(channel_coords(3000, 3000).unwrap(), (24, 119));
    }

    #[test]
    fn channel_out_of_range_rejected() {
        assert!(channel_coords(0, 512).is_err());
        assert!(channel_coords(513, 512).is_err());
    }

    #[test]
    fn single_split_maps_every_channel_to_region_zero() {
        let map = channel_regions(512, 1, SplitAxis::Columns).unwrap();
        assert!(map[1..].iter().all(|&r| r == 0));
    }

    #[test]
    fn four_way_split_is_even_and_total() {
        let map = channel_regions(512, 4, SplitAxis::Columns).unwrap();
        let mut counts = [0usize; 4];
        for &region in &map[1..] {
            counts[region] += 1;
        }
        assert_eq!(counts, [128, 128, 128, 128]);
    }

    #[test]
    fn uneven_split_names_valid_divisors() {
        let err = channel_regions(512, 5, SplitAxis::Columns).unwrap_err();
        match err {
            ConfigError::UnevenSplit {
                split,
                axis_len,
                divisors,
            } => {
                assert_eq!(split, 5);
                assert_eq!(axis_len, 32);
                assert_eq!(divisors, vec![1, 2, 4, 8, 16, 32]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn row_axis_split_uses_row_count() {
        let map = channel_regions(512, 2, SplitAxis::Rows).unwrap();
        // Rows 0..8 are region 0, rows 8..16 region 1; channel 257 starts row 8.
        assert_eq!(map[256], 0);
        assert_eq!(map[257], 1);
    }

    #[test]
    fn regions_are_geometric_blocks() {
        // Adjacent channels in the same column stripe share a region.
        let map = channel_regions(3000, 12, SplitAxis::Columns).unwrap();
        for channel in 1..=250 {
            assert_eq!(map[channel], 0, "channel {channel}");
        }
        for channel in 251..=500 {
            assert_eq!(map[channel], 1, "channel {channel}");
        }
    }
}
