use rand::Rng;
use shared::domain::Coordinate;

/// Supplies the display coordinate for each new session.
pub trait CoordinateSource: Send {
    fn next_coordinate(&mut self) -> Coordinate;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCoordinates;

impl CoordinateSource for RandomCoordinates {
    fn next_coordinate(&mut self) -> Coordinate {
        generate_coordinate(&mut rand::thread_rng())
    }
}

/// Two four-digit groups without leading zeros, e.g. `4821-1937`.
pub fn generate_coordinate<R: Rng + ?Sized>(rng: &mut R) -> Coordinate {
    let first: u16 = rng.gen_range(1000..=9999);
    let second: u16 = rng.gen_range(1000..=9999);
    Coordinate(format!("{first}-{second}"))
}

pub fn is_well_formed(coordinate: &Coordinate) -> bool {
    let Some((first, second)) = coordinate.as_str().split_once('-') else {
        return false;
    };
    [first, second].iter().all(|group| {
        group.len() == 4
            && group.bytes().all(|b| b.is_ascii_digit())
            && !group.starts_with('0')
    })
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn generated_coordinates_are_well_formed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let coordinate = generate_coordinate(&mut rng);
            assert!(is_well_formed(&coordinate), "bad coordinate {coordinate}");
        }
    }

    #[test]
    fn rejects_malformed_coordinates() {
        assert!(!is_well_formed(&Coordinate::new("12345678")));
        assert!(!is_well_formed(&Coordinate::new("0123-4567")));
        assert!(!is_well_formed(&Coordinate::new("1234-56a8")));
        assert!(is_well_formed(&Coordinate::new("1234-5678")));
    }

    #[test]
    fn random_source_varies_between_sessions() {
        let mut source = RandomCoordinates;
        let drawn: std::collections::HashSet<_> =
            (0..20).map(|_| source.next_coordinate()).collect();
        assert!(drawn.len() > 1);
    }
}
