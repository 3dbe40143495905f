//! API access control: host allow-list and command groups.
//!
//! Hosts are granted a one-letter group. `W` holds every privilege, `R`
//! only the non-mutating commands, and letters defined via `--api-groups`
//! carry an explicit command list. Addresses are compared as IPv4-mapped
//! IPv6 so one code path serves both families.

use super::command::COMMANDS;
use crate::error::ApiError;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};

pub const PRIVGROUP: char = 'W';
pub const NOPRIVGROUP: char = 'R';

/// Command-list separator; lists are stored `|cmd|cmd|` so a substring
/// probe of `|name|` is exact.
const SEP: char = '|';

#[derive(Debug, Clone)]
struct AllowEntry {
    group: char,
    base: u128,
    mask: u128,
}

/// Parsed `--api-allow` / `--api-groups` state.
#[derive(Debug, Clone)]
pub struct AccessControl {
    entries: Vec<AllowEntry>,
    /// Group letter -> `|`-delimited command list. `W` is implicit.
    groups: HashMap<char, String>,
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn prefix_mask(ip: IpAddr, prefix: u32) -> u128 {
    // IPv4 prefixes shift into the mapped tail
    let bits = match ip {
        IpAddr::V4(_) => 96 + prefix.min(32),
        IpAddr::V6(_) => prefix.min(128),
    };
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - bits)
    }
}

impl AccessControl {
    /// Build from the CLI options. With no allow-list only loopback is
    /// accepted (fully privileged); `--api-network` widens that to
    /// everyone at read-only privilege.
    pub fn from_options(
        api_allow: Option<&str>,
        api_groups: Option<&str>,
        api_network: bool,
    ) -> Result<Self, ApiError> {
        let mut control = AccessControl {
            entries: Vec::new(),
            groups: HashMap::new(),
        };

        control.setup_groups(api_groups)?;

        match api_allow {
            Some(spec) => control.setup_allow(spec)?,
            None => {
                control.entries.push(AllowEntry {
                    group: PRIVGROUP,
                    base: ip_to_u128(IpAddr::V6(Ipv6Addr::LOCALHOST)),
                    mask: u128::MAX,
                });
                let v4_loop: IpAddr = "127.0.0.0".parse().expect("literal");
                let mask = prefix_mask(v4_loop, 8);
                control.entries.push(AllowEntry {
                    group: PRIVGROUP,
                    base: ip_to_u128(v4_loop) & mask,
                    mask,
                });
                if api_network {
                    control.entries.push(AllowEntry {
                        group: NOPRIVGROUP,
                        base: 0,
                        mask: 0,
                    });
                }
            }
        }

        Ok(control)
    }

    fn setup_allow(&mut self, spec: &str) -> Result<(), ApiError> {
        for raw in spec.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let bad = || ApiError::InvalidAllow(raw.to_string());

            let (group, rest) = match raw.split_once(':') {
                // a colon may also belong to a bare IPv6 address
                Some((g, rest)) if g.len() == 1 => {
                    let g = g.chars().next().expect("len checked").to_ascii_uppercase();
                    if !g.is_ascii_uppercase() {
                        return Err(ApiError::InvalidGroup(g));
                    }
                    (g, rest)
                }
                _ => (NOPRIVGROUP, raw),
            };

            let (addr_str, prefix) = match rest.split_once('/') {
                Some((a, p)) => (a, Some(p.parse::<u32>().map_err(|_| bad())?)),
                None => (rest, None),
            };
            let addr_str = addr_str.trim_matches(['[', ']']);

            // 0/0 is the documented "everyone" form
            if addr_str == "0" && prefix == Some(0) {
                self.entries.push(AllowEntry {
                    group,
                    base: 0,
                    mask: 0,
                });
                continue;
            }

            let ip: IpAddr = addr_str.parse().map_err(|_| bad())?;
            let mask = prefix_mask(ip, prefix.unwrap_or(match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            }));
            self.entries.push(AllowEntry {
                group,
                base: ip_to_u128(ip) & mask,
                mask,
            });
        }
        Ok(())
    }

    /// Interpret `--api-groups G:cmd1:cmd2,H:*`.
    fn setup_groups(&mut self, spec: Option<&str>) -> Result<(), ApiError> {
        if let Some(spec) = spec {
            for chunk in spec.split(',').filter(|c| !c.is_empty()) {
                let (letter, cmds) = chunk
                    .split_once(':')
                    .ok_or_else(|| ApiError::InvalidAllow(chunk.to_string()))?;
                let group = letter
                    .chars()
                    .next()
                    .filter(|_| letter.len() == 1)
                    .map(|c| c.to_ascii_uppercase())
                    .ok_or(ApiError::InvalidGroup('?'))?;
                if !group.is_ascii_uppercase()
                    || group == PRIVGROUP
                    || group == NOPRIVGROUP
                    || self.groups.contains_key(&group)
                {
                    return Err(ApiError::InvalidGroup(group));
                }

                let mut list = String::from(SEP);
                for cmd in cmds.split(':').filter(|c| !c.is_empty()) {
                    if cmd == "*" {
                        for def in COMMANDS.iter().filter(|d| !d.write_mode) {
                            push_unique(&mut list, def.name);
                        }
                    } else {
                        let def = COMMANDS
                            .iter()
                            .find(|d| d.name.eq_ignore_ascii_case(cmd))
                            .ok_or_else(|| ApiError::UnknownGroupCommand(cmd.to_string()))?;
                        push_unique(&mut list, def.name);
                    }
                }
                self.groups.insert(group, list);
            }
        }

        // R is always every non-mutating command
        let mut readonly = String::from(SEP);
        for def in COMMANDS.iter().filter(|d| !d.write_mode) {
            push_unique(&mut readonly, def.name);
        }
        self.groups.insert(NOPRIVGROUP, readonly);
        Ok(())
    }

    /// Which group does a connecting address land in, if any?
    pub fn group_for(&self, ip: IpAddr) -> Option<char> {
        let addr = ip_to_u128(ip);
        self.entries
            .iter()
            .find(|e| addr & e.mask == e.base)
            .map(|e| e.group)
    }

    /// May `group` run `command`?
    pub fn is_allowed(&self, group: char, command: &str) -> bool {
        if group == PRIVGROUP {
            return true;
        }
        let probe = format!("{SEP}{command}{SEP}");
        self.groups
            .get(&group)
            .map(|list| list.contains(&probe))
            .unwrap_or(false)
    }

    /// The access description for the `check` command.
    pub fn check(&self, group: char, command: &str) -> (bool, bool) {
        let exists = COMMANDS.iter().any(|d| d.name == command);
        (exists, exists && self.is_allowed(group, command))
    }
}

fn push_unique(list: &mut String, name: &str) {
    let probe = format!("{SEP}{name}{SEP}");
    if !list.contains(&probe) {
        list.push_str(name);
        list.push(SEP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn default_is_loopback_only() {
        let ac = AccessControl::from_options(None, None, false).unwrap();
        assert_eq!(ac.group_for(ip("127.0.0.1")), Some(PRIVGROUP));
        assert_eq!(ac.group_for(ip("::1")), Some(PRIVGROUP));
        assert_eq!(ac.group_for(ip("192.168.0.10")), None);
    }

    #[test]
    fn api_network_widens_readonly() {
        let ac = AccessControl::from_options(None, None, true).unwrap();
        assert_eq!(ac.group_for(ip("192.168.0.10")), Some(NOPRIVGROUP));
        // loopback keeps its privileges (listed first)
        assert_eq!(ac.group_for(ip("127.0.0.1")), Some(PRIVGROUP));
    }

    #[test]
    fn allow_list_with_prefix() {
        let ac =
            AccessControl::from_options(Some("W:192.168.0.0/24,10.0.0.1"), None, false).unwrap();
        assert_eq!(ac.group_for(ip("192.168.0.77")), Some('W'));
        assert_eq!(ac.group_for(ip("192.168.1.77")), None);
        assert_eq!(ac.group_for(ip("10.0.0.1")), Some(NOPRIVGROUP));
        assert_eq!(ac.group_for(ip("10.0.0.2")), None);
    }

    #[test]
    fn readonly_group_rejects_write_commands() {
        let ac = AccessControl::from_options(Some("R:127.0.0.1"), None, false).unwrap();
        assert_eq!(ac.group_for(ip("127.0.0.1")), Some(NOPRIVGROUP));
        assert!(ac.is_allowed(NOPRIVGROUP, "summary"));
        assert!(!ac.is_allowed(NOPRIVGROUP, "quit"));
        assert!(!ac.is_allowed(NOPRIVGROUP, "ascdisable"));
    }

    #[test]
    fn privileged_group_allows_everything() {
        let ac = AccessControl::from_options(None, None, false).unwrap();
        assert!(ac.is_allowed(PRIVGROUP, "quit"));
        assert!(ac.is_allowed(PRIVGROUP, "version"));
        assert!(ac.is_allowed(PRIVGROUP, "no-such-command"));
    }

    #[test]
    fn custom_group_gets_exactly_its_list() {
        let ac = AccessControl::from_options(
            Some("A:10.0.0.0/8"),
            Some("A:version:summary:quit"),
            false,
        )
        .unwrap();
        assert_eq!(ac.group_for(ip("10.1.2.3")), Some('A'));
        assert!(ac.is_allowed('A', "version"));
        assert!(ac.is_allowed('A', "quit"));
        assert!(!ac.is_allowed('A', "devs"));
    }

    #[test]
    fn star_expands_to_readonly_commands() {
        let ac = AccessControl::from_options(None, Some("B:*:quit"), false).unwrap();
        assert!(ac.is_allowed('B', "summary"));
        assert!(ac.is_allowed('B', "devs"));
        assert!(ac.is_allowed('B', "quit"));
        assert!(!ac.is_allowed('B', "restart"));
    }

    #[test]
    fn group_letters_w_and_r_are_reserved() {
        assert!(AccessControl::from_options(None, Some("W:version"), false).is_err());
        assert!(AccessControl::from_options(None, Some("R:version"), false).is_err());
    }

    #[test]
    fn unknown_commands_in_groups_are_fatal() {
        assert!(AccessControl::from_options(None, Some("A:frobnicate"), false).is_err());
    }

    #[test]
    fn substring_names_do_not_leak_privileges() {
        // "asc" is not a command; it must not match "ascset" by substring
        let ac = AccessControl::from_options(None, Some("C:ascset"), false).unwrap();
        assert!(ac.is_allowed('C', "ascset"));
        assert!(!ac.is_allowed('C', "asc"));
        assert!(!ac.is_allowed('C', "set"));
    }
}
