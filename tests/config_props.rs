use proptest::prelude::*;
use sha2::{Digest, Sha256};

use switchboard_lib::config::{parse_artifact, render_artifact};
use switchboard_lib::profile::{get_profile, ProfileId};
use switchboard_lib::settings::{split_host_port, SettingCheck, SettingsMap};
use switchboard_lib::swap::file_sha256;

proptest! {
    #[test]
    fn well_formed_host_port_values_pass_and_split(
        host in "[a-z][a-z0-9.-]{0,30}",
        port in 1u16..,
    ) {
        let value = format!("{host}:{port}");
        prop_assert!(SettingCheck::HostPort.validate(&value).is_ok(), "{value}");
        let (split_host, split_port) = split_host_port(&value).unwrap();
        prop_assert_eq!(split_host, host);
        prop_assert_eq!(split_port, port);
    }

    #[test]
    fn out_of_range_ports_are_rejected(
        host in "[a-z][a-z0-9.-]{0,30}",
        port in 65_536u32..=99_999,
    ) {
        let value = format!("{host}:{port}");
        prop_assert!(SettingCheck::HostPort.validate(&value).is_err());
    }

    #[test]
    fn artifact_rendering_round_trips(
        entries in proptest::collection::btree_map(
            "[A-Z][A-Z0-9_]{0,20}",
            "[a-zA-Z0-9 :/@._=-]{0,40}[a-zA-Z0-9:/@._=-]",
            0..8,
        ),
    ) {
        let mut settings = SettingsMap::new();
        for (key, value) in entries {
            if key == "SWITCHBOARD_PROFILE" {
                continue;
            }
            settings.insert(key, value);
        }
        let rendered = render_artifact(get_profile(ProfileId::Mysql), &settings);
        let parsed = parse_artifact(&rendered).unwrap();
        prop_assert_eq!(parsed.profile, ProfileId::Mysql);
        prop_assert_eq!(parsed.settings, settings);
    }

    #[test]
    fn file_checksum_matches_an_in_memory_digest(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.entry");
        std::fs::write(&path, &bytes).unwrap();
        let expected = format!("{:x}", Sha256::digest(&bytes));
        prop_assert_eq!(file_sha256(&path).unwrap(), expected);
    }
}
