use serde::Serialize;

/// Lower bounds of the non-terminal bands, paired with their names. The band
/// ends where the next one starts; the last entry is open-ended.
const BANDS: [(u32, &str); 4] = [
    (0, "🟢 Новичок"),
    (10, "🔵 Активный"),
    (20, "🟣 Лидер"),
    (40, "🔴 Легенда"),
];

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Tier {
    #[serde(skip)]
    rank: u8,
    pub name: &'static str,
    pub next_threshold: Option<u32>,
    pub progress_percent: u8,
}

impl Tier {
    /// 1-based position of the tier, terminal tier is 4.
    pub fn rank(&self) -> u8 {
        self.rank
    }

    pub fn is_terminal(&self) -> bool {
        self.next_threshold.is_none()
    }
}

pub fn tier_for(referrals: u32) -> Tier {
    let idx = BANDS
        .iter()
        .rposition(|(floor, _)| referrals >= *floor)
        .unwrap_or(0);
    let (floor, name) = BANDS[idx];
    let rank = idx as u8 + 1;
    match BANDS.get(idx + 1) {
        Some((ceiling, _)) => {
            let span = u64::from(ceiling - floor);
            let done = u64::from(referrals - floor);
            let progress = ((100 * done + span / 2) / span).min(100) as u8;
            Tier {
                rank,
                name,
                next_threshold: Some(*ceiling),
                progress_percent: progress,
            }
        }
        None => Tier {
            rank,
            name,
            next_threshold: None,
            progress_percent: 100,
        },
    }
}
