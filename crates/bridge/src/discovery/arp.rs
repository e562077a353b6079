// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS ARP table reads, used to attach MAC addresses to discovered hosts.

use std::collections::HashMap;

/// Read the kernel ARP table as `ip → mac`. Best-effort: an unreadable table
/// yields an empty map, never an error.
pub fn table() -> HashMap<String, String> {
    #[cfg(target_os = "linux")]
    {
        read_proc_net_arp().unwrap_or_default()
    }
    #[cfg(not(target_os = "linux"))]
    {
        read_arp_command().unwrap_or_default()
    }
}

/// `/proc/net/arp` columns: IP, HW type, flags, HW address, mask, device.
#[cfg(target_os = "linux")]
fn read_proc_net_arp() -> anyhow::Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string("/proc/net/arp")?;
    let mut out = HashMap::new();
    for line in contents.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let (Some(ip), Some(mac)) = (cols.first(), cols.get(3)) else { continue };
        if *mac == "00:00:00:00:00:00" {
            continue;
        }
        out.insert((*ip).to_owned(), (*mac).to_owned());
    }
    Ok(out)
}

/// Parse `arp -a` output: `? (192.168.1.174) at aa:bb:cc:dd:ee:ff on en0`.
#[cfg(not(target_os = "linux"))]
fn read_arp_command() -> anyhow::Result<HashMap<String, String>> {
    let output = std::process::Command::new("arp").arg("-a").output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_arp_output(&text))
}

#[cfg(any(not(target_os = "linux"), test))]
fn parse_arp_output(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Ok(re) = regex::Regex::new(r"\((\d+\.\d+\.\d+\.\d+)\)\s+at\s+([0-9a-fA-F:]{11,17})")
    else {
        return out;
    };
    for caps in re.captures_iter(text) {
        if let (Some(ip), Some(mac)) = (caps.get(1), caps.get(2)) {
            out.insert(ip.as_str().to_owned(), mac.as_str().to_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::parse_arp_output;

    #[test]
    fn parses_bsd_style_output() {
        let text = "\
? (192.168.1.1) at 0:11:22:33:44:55 on en0 ifscope [ethernet]
? (192.168.1.174) at AA:BB:CC:DD:EE:FF on en0 ifscope [ethernet]
? (224.0.0.251) at 1:0:5e:0:0:fb on en0 ifscope permanent [ethernet]";
        let table = parse_arp_output(text);
        assert_eq!(table.get("192.168.1.174").map(String::as_str), Some("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn empty_output_yields_empty_table() {
        assert!(parse_arp_output("").is_empty());
    }
}
