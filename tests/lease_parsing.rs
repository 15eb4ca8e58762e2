//! Lease file parsing against dhclient output

use chrono::{TimeZone, Utc};
use libnetagent::dhcp_lease::{parse_leases, read_lease_file, LeaseDate};
use std::net::Ipv4Addr;
use tempfile::TempDir;

const RENEWED: &str = r#"default-duid "\000\001\000\001.\2341\334\246\3523\013\247";
lease {
  interface "wlan0";
  fixed-address 10.20.30.40;
  option subnet-mask 255.255.255.0;
  option routers 10.20.30.1;
  option dhcp-lease-time 600;
  option dhcp-message-type 5;
  option domain-name-servers 10.20.30.1;
  option dhcp-server-identifier 10.20.30.1;
  renew 4 2025/07/17 09:00:00;
  rebind 4 2025/07/17 09:03:45;
  expire 4 2025/07/17 09:05:00;
}
lease {
  interface "wlan0";
  fixed-address 10.20.30.40;
  option subnet-mask 255.255.255.0;
  option routers 10.20.30.254;
  option dhcp-lease-time 600;
  option domain-name-servers 10.20.30.254,9.9.9.9;
  option dhcp-server-identifier 10.20.30.254;
  renew 4 2025/07/17 09:05:00;
  rebind 4 2025/07/17 09:08:45;
  expire 4 2025/07/17 09:10:00;
}
"#;

#[test]
fn test_renewal_block_is_current() {
    let lease = parse_leases(RENEWED).unwrap().unwrap();

    assert_eq!(lease.interface, "wlan0");
    assert_eq!(lease.address, Ipv4Addr::new(10, 20, 30, 40));
    assert_eq!(lease.prefix_len, 24);
    assert_eq!(lease.gateway, Ipv4Addr::new(10, 20, 30, 254));
    assert_eq!(lease.dns_servers, vec![Ipv4Addr::new(10, 20, 30, 254), Ipv4Addr::new(9, 9, 9, 9)]);
    assert_eq!(lease.lease_time, Some(600));
    assert_eq!(lease.server, Some(Ipv4Addr::new(10, 20, 30, 254)));
    assert_eq!(
        lease.expire,
        LeaseDate::At(Utc.with_ymd_and_hms(2025, 7, 17, 9, 10, 0).unwrap())
    );
}

#[test]
fn test_expiry_follows_expire_date() {
    let lease = parse_leases(RENEWED).unwrap().unwrap();
    let before = Utc.with_ymd_and_hms(2025, 7, 17, 9, 9, 59).unwrap();
    let after = Utc.with_ymd_and_hms(2025, 7, 17, 9, 10, 1).unwrap();

    assert!(!lease.is_expired(before));
    assert!(lease.is_expired(after));
}

#[test]
fn test_missing_mask_means_host_address() {
    let content = "lease {\n  interface \"wlan2\";\n  fixed-address 172.16.0.9;\n  option routers 172.16.0.1;\n  expire never;\n}\n";
    let lease = parse_leases(content).unwrap().unwrap();
    assert_eq!(lease.prefix_len, 32);
    assert_eq!(lease.expire, LeaseDate::Never);
    assert!(!lease.is_expired(Utc::now()));
}

#[test]
fn test_malformed_address_is_an_error() {
    let content = "lease {\n  interface \"wlan0\";\n  fixed-address 10.0.0.300;\n  option routers 10.0.0.1;\n}\n";
    assert!(parse_leases(content).is_err());
}

#[tokio::test]
async fn test_read_lease_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dhclient.wlan0.leases");

    assert_eq!(read_lease_file(&path).await.unwrap(), None);

    std::fs::write(&path, RENEWED).unwrap();
    let lease = read_lease_file(&path).await.unwrap().unwrap();
    assert_eq!(lease.gateway, Ipv4Addr::new(10, 20, 30, 254));
}
