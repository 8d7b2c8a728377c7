//! Permanent achievements unlocked by progress thresholds.

use crate::store::Progress;

#[derive(Debug)]
pub struct Badge {
    pub id: &'static str,
    pub name: &'static str,
    earned: fn(&Progress) -> bool,
}

impl Badge {
    pub fn is_earned_by(&self, progress: &Progress) -> bool {
        (self.earned)(progress)
    }
}

pub static BADGES: [Badge; 4] = [
    Badge {
        id: "first-win",
        name: "First Win",
        earned: |progress| !progress.completed_levels.is_empty(),
    },
    Badge {
        id: "five-levels",
        name: "Five Levels Cleared",
        earned: |progress| progress.completed_levels.len() >= 5,
    },
    Badge {
        id: "xp-100",
        name: "100 XP",
        earned: |progress| progress.xp >= 100,
    },
    Badge {
        id: "xp-500",
        name: "500 XP",
        earned: |progress| progress.xp >= 500,
    },
];

pub fn find(id: &str) -> Option<&'static Badge> {
    BADGES.iter().find(|badge| badge.id == id)
}

/// Badges whose predicate holds but which `progress` does not list yet.
pub fn newly_earned(progress: &Progress) -> Vec<&'static Badge> {
    BADGES
        .iter()
        .filter(|badge| badge.is_earned_by(progress) && !progress.badges.contains(badge.id))
        .collect()
}
