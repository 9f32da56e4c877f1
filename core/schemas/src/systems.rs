use serde::Serialize;

/// One row of the static ECU system table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemConfig {
    pub execution: &'static str,
    pub family: &'static str,
    pub server_can: Option<&'static str>,
}

const fn system(
    execution: &'static str,
    family: &'static str,
    server_can: Option<&'static str>,
) -> SystemConfig {
    SystemConfig {
        execution,
        family,
        server_can,
    }
}

pub const SYSTEM_CONFIGS: &[SystemConfig] = &[
    system("APS2", "APS", Some("30")),
    system("EBS9", "BMS", Some("0B")),
    system("CMS1", "CMS", Some("47")),
    system("DIS3", "DIS", Some("4A")),
    system("FLC3", "FLC", Some("EB")),
    system("TPM2", "TPM", Some("33")),
    system("COO11", "COO", Some("27")),
    system("PDS2", "DCSXA", Some("ED")),
    system("DCS2", "DCS", Some("EC")),
    system("DD", "DIM", None),
    system("DDU", "DIM", None),
    system("CID1", "DIM", None),
    system("C400", "RTC", Some("4A")),
    system("CUV3", "VIS", Some("1E")),
    system("EPB1", "PBC", Some("50")),
    system("ECU1", "ECU", None),
    system("CCU1", "CCM", Some("19")),
    system("C008", "COO", None),
    system("DDU1", "DDU", Some("17")),
    system("DD1", "DD", Some("3B")),
    system("EMS10", "EMC", Some("00")),
    system("CID2", "CID", Some("54")),
    system("ECAKB4", "ECA", Some("FD")),
    system("TMS3", "TMS", Some("DC")),
];

impl SystemConfig {
    /// First entry whose execution or family equals `identifier`.
    pub fn by_identifier(identifier: &str) -> Option<SystemConfig> {
        SYSTEM_CONFIGS
            .iter()
            .find(|c| c.execution == identifier || c.family == identifier)
            .copied()
    }

    /// First family or execution code contained (case-insensitively) in a file name.
    pub fn by_filename(filename: &str) -> Option<SystemConfig> {
        let lowered = filename.to_lowercase();
        let identifiers = SYSTEM_CONFIGS
            .iter()
            .map(|c| c.family)
            .chain(SYSTEM_CONFIGS.iter().map(|c| c.execution));

        for identifier in identifiers {
            if lowered.contains(&identifier.to_lowercase()) {
                return SystemConfig::by_identifier(identifier);
            }
        }
        None
    }

    pub fn by_server_can(server_can: &str) -> Option<SystemConfig> {
        SYSTEM_CONFIGS
            .iter()
            .find(|c| c.server_can == Some(server_can))
            .copied()
    }

    pub fn by_execution(execution: &str) -> Option<SystemConfig> {
        SYSTEM_CONFIGS
            .iter()
            .find(|c| c.execution == execution)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_identifier_matches_family_or_execution() {
        assert_eq!(SystemConfig::by_identifier("TPM2").unwrap().family, "TPM");
        assert_eq!(SystemConfig::by_identifier("TPM").unwrap().execution, "TPM2");
        assert!(SystemConfig::by_identifier("NOPE").is_none());
    }

    #[test]
    fn test_lookup_by_filename_is_case_insensitive() {
        let config = SystemConfig::by_filename("circuit_tpm_rev3.pdf").unwrap();
        assert_eq!(config.execution, "TPM2");
    }

    #[test]
    fn test_lookup_by_server_can() {
        assert_eq!(SystemConfig::by_server_can("33").unwrap().execution, "TPM2");
        assert!(SystemConfig::by_server_can("ZZ").is_none());
    }
}
