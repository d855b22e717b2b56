//! Binary radix trie answering "is this IPv4 address in the domestic set?"
//! in bounded time over tens of thousands of CIDRs.
//!
//! Grounded in `original_source/cidradix/cidradix.go`: walk from the root
//! bit-by-bit (most significant first), creating nodes as needed, marking
//! the node reached at the end of the prefix as terminal. A lookup that
//! reaches any terminal node on the way down returns true; the tree never
//! needs to distinguish "exact" vs. "covered by a shorter prefix" because
//! CIDRs in this domain are loaded once at startup and never overlap in a
//! way that would make longest-prefix-match meaningful here.

use std::net::Ipv4Addr;
use thiserror::Error;

const START_BIT: u32 = 0x8000_0000;

#[derive(Debug, Default)]
struct Node {
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    terminal: bool,
}

/// A radix trie over IPv4 CIDR ranges.
#[derive(Debug, Default)]
pub struct ChnRouteTrie {
    root: Node,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid CIDR {0:?}: {1}")]
    Malformed(String, &'static str),
    #[error("mask bits {0} out of range for IPv4 (must be 0..=32)")]
    InvalidMaskBits(u8),
}

impl ChnRouteTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a CIDR given as a dotted-quad IPv4 address and prefix length.
    pub fn add_cidr(&mut self, ip: Ipv4Addr, mask_bits: u8) -> Result<(), CidrError> {
        if mask_bits > 32 {
            return Err(CidrError::InvalidMaskBits(mask_bits));
        }

        let ip_bits = u32::from(ip);
        let mut bit = START_BIT;
        let mut node = &mut self.root;

        for _ in 0..mask_bits {
            let go_right = ip_bits & bit != 0;
            node = if go_right {
                node.right.get_or_insert_with(|| Box::new(Node::default()))
            } else {
                node.left.get_or_insert_with(|| Box::new(Node::default()))
            };
            bit >>= 1;
        }

        node.terminal = true;
        Ok(())
    }

    /// Parse and insert a CIDR in `a.b.c.d/n` form.
    pub fn add_cidr_str(&mut self, cidr: &str) -> Result<(), CidrError> {
        let (ip_part, mask_part) = cidr
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(cidr.to_string(), "missing '/'"))?;

        let ip: Ipv4Addr = ip_part
            .parse()
            .map_err(|_| CidrError::Malformed(cidr.to_string(), "invalid IPv4 address"))?;
        let mask_bits: u8 = mask_part
            .parse()
            .map_err(|_| CidrError::Malformed(cidr.to_string(), "invalid prefix length"))?;

        self.add_cidr(ip, mask_bits)
    }

    /// Load one CIDR per line. Blank lines are skipped; no comment syntax
    /// is recognized (routing tables don't carry `#` comments upstream).
    pub fn load_lines<'a>(&mut self, lines: impl Iterator<Item = &'a str>) -> Result<usize, CidrError> {
        let mut count = 0;
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.add_cidr_str(line)?;
            count += 1;
        }
        Ok(count)
    }

    /// At most 32 node traversals for IPv4. Returns true as soon as a
    /// terminal node is reached along the path.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip_bits = u32::from(ip);
        let mut bit = START_BIT;
        let mut node = &self.root;

        loop {
            if node.terminal {
                return true;
            }

            let next = if ip_bits & bit != 0 {
                &node.right
            } else {
                &node.left
            };

            match next {
                Some(n) => {
                    node = n;
                    bit >>= 1;
                }
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let mut t = ChnRouteTrie::new();
        t.add_cidr_str("10.1.0.0/16").unwrap();

        assert!(t.contains("10.1.0.1".parse().unwrap()));
        assert!(!t.contains("10.2.0.1".parse().unwrap()));
    }

    #[test]
    fn exact_host_route() {
        let mut t = ChnRouteTrie::new();
        t.add_cidr_str("203.0.113.5/32").unwrap();

        assert!(t.contains("203.0.113.5".parse().unwrap()));
        assert!(!t.contains("203.0.113.6".parse().unwrap()));
    }

    #[test]
    fn default_route_matches_everything() {
        let mut t = ChnRouteTrie::new();
        t.add_cidr_str("0.0.0.0/0").unwrap();

        assert!(t.contains("1.2.3.4".parse().unwrap()));
        assert!(t.contains("255.255.255.255".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_cidrs() {
        let mut t = ChnRouteTrie::new();
        assert!(t.add_cidr_str("not-a-cidr").is_err());
        assert!(t.add_cidr_str("10.0.0.0/40").is_err());
    }

    #[test]
    fn many_cidrs_bounded_lookup() {
        let mut t = ChnRouteTrie::new();
        for i in 0..200u8 {
            t.add_cidr_str(&format!("10.{i}.0.0/16")).unwrap();
        }

        assert!(t.contains("10.50.1.1".parse().unwrap()));
        assert!(!t.contains("11.50.1.1".parse().unwrap()));
    }

    #[test]
    fn load_lines_skips_blanks() {
        let mut t = ChnRouteTrie::new();
        let n = t
            .load_lines("10.0.0.0/8\n\n  \n172.16.0.0/12\n".lines())
            .unwrap();

        assert_eq!(n, 2);
        assert!(t.contains("10.1.1.1".parse().unwrap()));
        assert!(t.contains("172.16.1.1".parse().unwrap()));
    }
}
