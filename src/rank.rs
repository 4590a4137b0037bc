//! Rank tiers, divisions, and the total order used by enforcement.
//!
//! The comparator is deliberately fail-open: when either side of a
//! comparison is unknown, the message is allowed. A malformed rank record
//! must never cause a timeout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ranked ladder tiers, lowest to highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Iron,
    Bronze,
    Silver,
    Gold,
    Platinum,
    Emerald,
    Diamond,
    Master,
    Grandmaster,
    Challenger,
}

impl Tier {
    /// Base weight of the tier. Tiers are 100 apart so the four divisions
    /// (worth up to 75) can never cross a tier boundary.
    pub fn weight(self) -> u32 {
        match self {
            Tier::Iron => 0,
            Tier::Bronze => 100,
            Tier::Silver => 200,
            Tier::Gold => 300,
            Tier::Platinum => 400,
            Tier::Emerald => 500,
            Tier::Diamond => 600,
            Tier::Master => 700,
            Tier::Grandmaster => 800,
            Tier::Challenger => 900,
        }
    }

    /// MASTER and above have no meaningful division.
    pub fn is_apex(self) -> bool {
        matches!(self, Tier::Master | Tier::Grandmaster | Tier::Challenger)
    }
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Tier, ()> {
        match s.to_ascii_uppercase().as_str() {
            "IRON" => Ok(Tier::Iron),
            "BRONZE" => Ok(Tier::Bronze),
            "SILVER" => Ok(Tier::Silver),
            "GOLD" => Ok(Tier::Gold),
            "PLATINUM" => Ok(Tier::Platinum),
            "EMERALD" => Ok(Tier::Emerald),
            "DIAMOND" => Ok(Tier::Diamond),
            "MASTER" => Ok(Tier::Master),
            "GRANDMASTER" => Ok(Tier::Grandmaster),
            "CHALLENGER" => Ok(Tier::Challenger),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Iron => "IRON",
            Tier::Bronze => "BRONZE",
            Tier::Silver => "SILVER",
            Tier::Gold => "GOLD",
            Tier::Platinum => "PLATINUM",
            Tier::Emerald => "EMERALD",
            Tier::Diamond => "DIAMOND",
            Tier::Master => "MASTER",
            Tier::Grandmaster => "GRANDMASTER",
            Tier::Challenger => "CHALLENGER",
        };
        f.write_str(s)
    }
}

/// Divisions within a tier, best (I) to worst (IV).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Division {
    I,
    II,
    III,
    IV,
}

impl Division {
    pub fn weight(self) -> u32 {
        match self {
            Division::IV => 0,
            Division::III => 25,
            Division::II => 50,
            Division::I => 75,
        }
    }
}

impl FromStr for Division {
    type Err = ();

    fn from_str(s: &str) -> Result<Division, ()> {
        match s.to_ascii_uppercase().as_str() {
            "I" | "1" => Ok(Division::I),
            "II" | "2" => Ok(Division::II),
            "III" | "3" => Ok(Division::III),
            "IV" | "4" => Ok(Division::IV),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Division {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Division::I => "I",
            Division::II => "II",
            Division::III => "III",
            Division::IV => "IV",
        };
        f.write_str(s)
    }
}

/// Normalize a user-supplied division string to roman form.
///
/// Accepts `1..4` and `I..IV` in any case. Idempotent by construction.
pub fn normalize_division(raw: &str) -> Option<&'static str> {
    match raw.parse::<Division>().ok()? {
        Division::I => Some("I"),
        Division::II => Some("II"),
        Division::III => Some("III"),
        Division::IV => Some("IV"),
    }
}

/// A concrete rank: tier plus optional division.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rank {
    pub tier: Tier,
    pub division: Option<Division>,
}

impl Rank {
    pub fn new(tier: Tier, division: Option<Division>) -> Rank {
        Rank { tier, division }
    }

    /// Scalar position on the total order. Division contributes nothing at
    /// MASTER and above.
    pub fn value(&self) -> u32 {
        let base = self.tier.weight();
        if self.tier.is_apex() {
            base
        } else {
            base + self.division.map(Division::weight).unwrap_or(0)
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.division {
            Some(d) if !self.tier.is_apex() => write!(f, "{} {}", self.tier, d),
            _ => write!(f, "{}", self.tier),
        }
    }
}

/// Decide whether `user` satisfies the configured minimum.
///
/// Fail-open: an unknown rank on either side allows the message.
pub fn meets_minimum(user: Option<&Rank>, min: Option<&Rank>) -> bool {
    match (user, min) {
        (Some(user), Some(min)) => user.value() >= min.value(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(tier: Tier, division: Option<Division>) -> Rank {
        Rank::new(tier, division)
    }

    #[test]
    fn test_tier_weights_step_100() {
        assert_eq!(Tier::Iron.weight(), 0);
        assert_eq!(Tier::Gold.weight(), 300);
        assert_eq!(Tier::Challenger.weight(), 900);
    }

    #[test]
    fn test_division_weights() {
        assert_eq!(Division::IV.weight(), 0);
        assert_eq!(Division::III.weight(), 25);
        assert_eq!(Division::II.weight(), 50);
        assert_eq!(Division::I.weight(), 75);
    }

    #[test]
    fn test_meets_minimum_reflexive() {
        for tier in [Tier::Iron, Tier::Gold, Tier::Master, Tier::Challenger] {
            for division in [None, Some(Division::I), Some(Division::IV)] {
                let rank = r(tier, division);
                assert!(meets_minimum(Some(&rank), Some(&rank)));
            }
        }
    }

    #[test]
    fn test_order_across_tiers() {
        let plat2 = r(Tier::Platinum, Some(Division::II));
        let gold4 = r(Tier::Gold, Some(Division::IV));
        assert!(meets_minimum(Some(&plat2), Some(&gold4)));
        assert!(!meets_minimum(Some(&gold4), Some(&plat2)));
    }

    #[test]
    fn test_order_within_tier() {
        let gold1 = r(Tier::Gold, Some(Division::I));
        let gold4 = r(Tier::Gold, Some(Division::IV));
        assert!(meets_minimum(Some(&gold1), Some(&gold4)));
        assert!(!meets_minimum(Some(&gold4), Some(&gold1)));
    }

    #[test]
    fn test_apex_division_ignored() {
        let m1 = r(Tier::Master, Some(Division::I));
        let m4 = r(Tier::Master, Some(Division::IV));
        assert_eq!(m1.value(), m4.value());
        assert!(meets_minimum(Some(&m4), Some(&m1)));
    }

    #[test]
    fn test_missing_division_counts_as_lowest() {
        let gold = r(Tier::Gold, None);
        let gold4 = r(Tier::Gold, Some(Division::IV));
        assert_eq!(gold.value(), gold4.value());
    }

    #[test]
    fn test_fail_open_on_unknown() {
        let gold = r(Tier::Gold, Some(Division::IV));
        assert!(meets_minimum(None, Some(&gold)));
        assert!(meets_minimum(Some(&gold), None));
        assert!(meets_minimum(None, None));
    }

    #[test]
    fn test_normalize_division_idempotent() {
        for raw in ["1", "2", "3", "4", "I", "II", "III", "IV", "iv"] {
            let once = normalize_division(raw).unwrap();
            assert_eq!(normalize_division(once), Some(once));
        }
        assert_eq!(normalize_division("V"), None);
        assert_eq!(normalize_division("0"), None);
    }

    #[test]
    fn test_tier_parse_case_insensitive() {
        assert_eq!("grandmaster".parse::<Tier>(), Ok(Tier::Grandmaster));
        assert_eq!("Gold".parse::<Tier>(), Ok(Tier::Gold));
        assert!("wood".parse::<Tier>().is_err());
    }

    #[test]
    fn test_rank_display() {
        assert_eq!(r(Tier::Gold, Some(Division::II)).to_string(), "GOLD II");
        assert_eq!(r(Tier::Master, Some(Division::I)).to_string(), "MASTER");
        assert_eq!(r(Tier::Silver, None).to_string(), "SILVER");
    }

    #[test]
    fn test_tier_serde_uppercase() {
        let tier: Tier = serde_json::from_str("\"EMERALD\"").unwrap();
        assert_eq!(tier, Tier::Emerald);
        assert_eq!(serde_json::to_string(&Tier::Iron).unwrap(), "\"IRON\"");
    }
}
