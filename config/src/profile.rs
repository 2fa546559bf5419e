use std::fmt;
use std::io::Error;

/// Name of the environment variable selecting the configuration profile.
const PROFILE_ENV_NAME: &str = "CONVEYOR_PROFILE";

const DEV_PROFILE_NAME: &str = "dev";

const TEST_PROFILE_NAME: &str = "test";

const PROD_PROFILE_NAME: &str = "prod";

/// Configuration profile layered on top of the base configuration file.
///
/// The profile picks which `{profile}.(yaml|yml|json)` file, if any, overrides `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Dev,
    Test,
    Prod,
}

impl Profile {
    /// Reads the profile from `CONVEYOR_PROFILE`, falling back to [`Profile::Dev`].
    pub fn load() -> Result<Profile, Error> {
        std::env::var(PROFILE_ENV_NAME)
            .unwrap_or_else(|_| DEV_PROFILE_NAME.into())
            .try_into()
    }

    /// Returns the file stem used for this profile's override file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Dev => DEV_PROFILE_NAME,
            Profile::Test => TEST_PROFILE_NAME,
            Profile::Prod => PROD_PROFILE_NAME,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Profile {
    type Error = Error;

    /// Parses a profile name case-insensitively.
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            DEV_PROFILE_NAME => Ok(Self::Dev),
            TEST_PROFILE_NAME => Ok(Self::Test),
            PROD_PROFILE_NAME => Ok(Self::Prod),
            other => Err(Error::other(format!(
                "{other} is not a supported profile. Use one of `{DEV_PROFILE_NAME}`, `{TEST_PROFILE_NAME}` or `{PROD_PROFILE_NAME}`.",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_profiles_case_insensitively() {
        assert_eq!(Profile::try_from("PROD".to_string()).unwrap(), Profile::Prod);
        assert_eq!(Profile::try_from("Test".to_string()).unwrap(), Profile::Test);
        assert_eq!(Profile::try_from("dev".to_string()).unwrap(), Profile::Dev);
    }

    #[test]
    fn rejects_unknown_profile() {
        let err = Profile::try_from("staging".to_string()).unwrap_err();
        assert!(err.to_string().contains("staging"));
    }
}
