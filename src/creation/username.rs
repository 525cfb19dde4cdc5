//! Niche-indexed username synthesis.

use rand::rngs::StdRng;
use rand::Rng;

/// Prefix pools per niche. Unknown niches fall back to slug fragments.
fn prefixes_for(niche_slug: &str) -> Vec<String> {
    let known: &[(&str, &[&str])] = &[
        (
            "personal_finance",
            &["money", "wealth", "finance", "cash", "invest"],
        ),
        ("fitness", &["fit", "gains", "lift", "sweat", "train"]),
        ("cooking", &["chef", "tasty", "kitchen", "recipe", "bites"]),
        ("travel", &["wander", "roam", "nomad", "voyage", "trips"]),
        ("tech", &["tech", "gadget", "byte", "code", "dev"]),
        (
            "motivation",
            &["mindset", "hustle", "grind", "rise", "focus"],
        ),
    ];

    for (slug, pool) in known {
        if *slug == niche_slug {
            return pool.iter().map(|s| s.to_string()).collect();
        }
    }
    niche_slug
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

/// One candidate username: niche prefix plus 3-6 random digits. Collisions
/// are handled by the caller re-rolling.
pub fn synthesize(rng: &mut StdRng, niche_slug: &str) -> String {
    let prefixes = prefixes_for(niche_slug);
    let prefix = if prefixes.is_empty() {
        "creator".to_string()
    } else {
        prefixes[rng.gen_range(0..prefixes.len())].clone()
    };

    let digit_count = rng.gen_range(3..=6);
    let mut username = prefix;
    for _ in 0..digit_count {
        username.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    username
}

/// A 16-character password with guaranteed class coverage.
pub fn generate_password(rng: &mut StdRng) -> String {
    const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
    const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
    const DIGIT: &[u8] = b"23456789";
    const SYMBOL: &[u8] = b"!@#$%^&*";
    const ALL: &[&[u8]] = &[LOWER, UPPER, DIGIT, SYMBOL];

    let mut chars: Vec<char> = Vec::with_capacity(16);
    for class in ALL {
        chars.push(char::from(class[rng.gen_range(0..class.len())]));
    }
    while chars.len() < 16 {
        let class = ALL[rng.gen_range(0..ALL.len())];
        chars.push(char::from(class[rng.gen_range(0..class.len())]));
    }
    // Shuffle so the class-coverage characters are not positional.
    for i in (1..chars.len()).rev() {
        chars.swap(i, rng.gen_range(0..=i));
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn username_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let name = synthesize(&mut rng, "personal_finance");
            let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
            assert!((3..=6).contains(&digits), "bad digit tail in {}", name);
            let prefix = &name[..name.len() - digits];
            assert!(
                ["money", "wealth", "finance", "cash", "invest"].contains(&prefix),
                "unexpected prefix in {}",
                name
            );
        }
    }

    #[test]
    fn unknown_niche_uses_slug_fragments() {
        let mut rng = StdRng::seed_from_u64(4);
        let name = synthesize(&mut rng, "cold_plunge");
        assert!(name.starts_with("cold") || name.starts_with("plunge"));
    }

    #[test]
    fn password_has_class_coverage() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let password = generate_password(&mut rng);
            assert_eq!(password.len(), 16);
            assert!(password.chars().any(|c| c.is_ascii_lowercase()));
            assert!(password.chars().any(|c| c.is_ascii_uppercase()));
            assert!(password.chars().any(|c| c.is_ascii_digit()));
            assert!(password.chars().any(|c| !c.is_ascii_alphanumeric()));
        }
    }
}
