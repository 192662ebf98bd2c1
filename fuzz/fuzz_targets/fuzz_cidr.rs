//! Fuzz testing for CIDR parsing and matching.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_cidr
//! ```

#![no_main]

use std::net::IpAddr;

use libfuzzer_sys::fuzz_target;
use request_gate::middleware::CidrRange;

fuzz_target!(|input: (&str, [u8; 16], bool)| {
    let (raw, octets, v4) = input;

    let Ok(range) = raw.parse::<CidrRange>() else {
        return;
    };

    // Display output parses back to the same network
    let reparsed: CidrRange = range
        .to_string()
        .parse()
        .expect("displayed CIDR must parse");
    assert_eq!(range, reparsed);

    let ip = if v4 {
        IpAddr::from([octets[0], octets[1], octets[2], octets[3]])
    } else {
        IpAddr::from(octets)
    };
    assert_eq!(range.contains(&ip), reparsed.contains(&ip));
});
