//! Built-in rotation zones.
//!
//! Ten oceanic/continental windows covering the main shipping corridors.
//! Priority weights how many slots a zone gets per rotation cycle (3 = the
//! busiest corridors), not how often vessels inside it report.

use crate::models::{Region, RegionBounds};

fn region(id: &str, name: &str, priority: u8, bounds: RegionBounds) -> Region {
    Region {
        id: id.to_string(),
        name: name.to_string(),
        bounds,
        priority,
    }
}

/// Default ten-zone coverage; priorities sum to 20 schedule slots per cycle.
pub fn default_regions() -> Vec<Region> {
    vec![
        region(
            "north-atlantic",
            "North Atlantic",
            3,
            RegionBounds::new(25.0, 60.0, -80.0, -10.0),
        ),
        region(
            "north-sea-baltic",
            "North Sea & Baltic",
            3,
            RegionBounds::new(50.0, 66.0, -5.0, 30.0),
        ),
        region(
            "east-asia",
            "East Asia",
            3,
            RegionBounds::new(18.0, 45.0, 105.0, 145.0),
        ),
        region(
            "mediterranean",
            "Mediterranean",
            2,
            RegionBounds::new(30.0, 46.0, -6.0, 37.0),
        ),
        region(
            "north-pacific-east",
            "North Pacific (American coast)",
            2,
            RegionBounds::new(20.0, 60.0, -175.0, -115.0),
        ),
        region(
            "southeast-asia",
            "Southeast Asia",
            2,
            RegionBounds::new(-10.0, 18.0, 95.0, 130.0),
        ),
        region(
            "gulf-caribbean",
            "Gulf of Mexico & Caribbean",
            2,
            RegionBounds::new(8.0, 31.0, -98.0, -60.0),
        ),
        region(
            "south-atlantic",
            "South Atlantic",
            1,
            RegionBounds::new(-45.0, 0.0, -60.0, 15.0),
        ),
        region(
            "indian-ocean",
            "Indian Ocean",
            1,
            RegionBounds::new(-35.0, 25.0, 40.0, 100.0),
        ),
        region(
            "oceania",
            "Oceania",
            1,
            RegionBounds::new(-48.0, -8.0, 110.0, 180.0),
        ),
    ]
}
