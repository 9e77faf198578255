//! First-fit block search inside network pools

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Private ranges the allocator may carve remapped blocks from
pub const DEFAULT_POOLS: [&str; 3] = ["10.0.0.0/8", "192.168.0.0/16", "172.16.0.0/12"];

/// Check if two CIDR blocks overlap
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// First block in `used` that overlaps `cidr`
pub fn first_overlap<'a>(cidr: &Ipv4Net, used: impl IntoIterator<Item = &'a Ipv4Net>) -> Option<Ipv4Net> {
    used.into_iter().find(|u| overlaps(cidr, u)).copied()
}

fn start(net: &Ipv4Net) -> u64 {
    u64::from(u32::from(net.network()))
}

fn end(net: &Ipv4Net) -> u64 {
    u64::from(u32::from(net.broadcast()))
}

/// Align an address up to the next boundary of `block_size`
fn align_up(addr: u64, block_size: u64) -> u64 {
    addr.div_ceil(block_size) * block_size
}

/// Find the first free `/prefix_len` block in `pool` that avoids every `used` block
fn find_gap(pool: &Ipv4Net, used: &[Ipv4Net], prefix_len: u8) -> Option<Ipv4Net> {
    if prefix_len < pool.prefix_len() || prefix_len > 32 {
        return None;
    }
    let block_size = 1u64 << (32 - prefix_len);
    let space_end = end(pool);

    let mut blocks: Vec<(u64, u64)> = used
        .iter()
        .filter(|u| overlaps(pool, u))
        .map(|u| (start(u), end(u)))
        .collect();
    blocks.sort_unstable();

    let mut current = start(pool);
    for (block_start, block_end) in blocks {
        let aligned = align_up(current, block_size);
        if aligned + block_size - 1 < block_start {
            break;
        }
        current = current.max(block_end + 1);
    }

    let aligned = align_up(current, block_size);
    if aligned + block_size - 1 > space_end {
        return None;
    }
    let addr = Ipv4Addr::from(u32::try_from(aligned).ok()?);
    Ipv4Net::new(addr, prefix_len).ok()
}

/// First free block of `prefix_len` across `pools`, in pool order
pub fn first_free_block<'a>(
    pools: impl IntoIterator<Item = &'a Ipv4Net>,
    used: &[Ipv4Net],
    prefix_len: u8,
) -> Option<Ipv4Net> {
    pools
        .into_iter()
        .find_map(|pool| find_gap(pool, used, prefix_len))
}

/// First free host address of `network` (network and broadcast excluded)
pub fn first_free_address(
    network: &Ipv4Net,
    used: impl Fn(&Ipv4Addr) -> bool,
) -> Option<Ipv4Addr> {
    network.hosts().find(|a| !used(a))
}
