// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use astro::angle::limit_to_two_PI;
use astro::coords::{alt_frm_eq, asc_frm_ecl, dec_frm_ecl};
use astro::ecliptic::mn_oblq_laskar;
use astro::sun::geocent_ecl_pos;
use astro::time::{CalType, Date, julian_day, mn_sidr};

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Returns the altitude of the Sun, in degrees, as seen from the given
/// location at `time`.
/// latitude: degrees, positive north.
/// longitude: degrees, positive east.
/// The result is geometric (no refraction correction), which is plenty for
/// deciding between day and twilight.
pub fn sun_altitude(latitude: f64, longitude: f64, time: &DateTime<Utc>) -> f64 {
    let jd = julian_day_from_utc(time);
    let (sun_ecl, _radius) = geocent_ecl_pos(jd);
    let oblq = mn_oblq_laskar(jd);
    let ra = asc_frm_ecl(sun_ecl.long, sun_ecl.lat, oblq);
    let dec = dec_frm_ecl(sun_ecl.long, sun_ecl.lat, oblq);

    // Note that astro::coords::hr_angl_frm_observer_long() has a bug. Fortunately
    // the correct relation is trivial.
    let hour_angle = mean_sidereal_time(time) + longitude.to_radians() - ra;

    alt_frm_eq(hour_angle, dec, latitude.to_radians()).to_degrees()
}

fn julian_day_from_utc(time: &DateTime<Utc>) -> f64 {
    let seconds_of_day = time.time().num_seconds_from_midnight() as f64 +
        time.time().nanosecond() as f64 / 1.0e9;
    let date = Date{year: time.year() as i16,
                    month: time.month() as u8,
                    decimal_day: time.day() as f64 + seconds_of_day / 86400.0,
                    cal_type: CalType::Gregorian};
    julian_day(&date)
}

// Greenwich mean sidereal time, radians.
fn mean_sidereal_time(time: &DateTime<Utc>) -> f64 {
    let date = Date{year: time.year() as i16,
                    month: time.month() as u8,
                    decimal_day: time.day() as f64,
                    cal_type: CalType::Gregorian};
    let jd = julian_day(&date);

    let utc_hours = time.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;
    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use super::*;

    #[test]
    fn test_sun_altitude_summer_noon() {
        // Local solar noon at longitude -105 is close to 19:00 UTC. Near the
        // June solstice the Sun culminates at 90 - 40 + 23.4 degrees.
        let noon = Utc.with_ymd_and_hms(2024, 6, 21, 19, 0, 0).unwrap();
        assert_abs_diff_eq!(sun_altitude(40.0, -105.0, &noon), 73.4, epsilon = 1.0);
    }

    #[test]
    fn test_sun_altitude_summer_midnight() {
        let midnight = Utc.with_ymd_and_hms(2024, 6, 21, 7, 0, 0).unwrap();
        assert_abs_diff_eq!(sun_altitude(40.0, -105.0, &midnight), -26.6,
                            epsilon = 1.0);
    }

    #[test]
    fn test_sun_altitude_equinox_sunrise() {
        // At the equinox the Sun rises near 06:00 local solar time everywhere.
        // The equation of time shifts this by several minutes in March.
        let sunrise = Utc.with_ymd_and_hms(2024, 3, 20, 6, 0, 0).unwrap();
        assert_abs_diff_eq!(sun_altitude(0.0, 0.0, &sunrise), 0.0, epsilon = 3.0);
    }

    #[test]
    fn test_mean_sidereal_time() {
        // Meeus example 12.a: 1987 April 10, 0h UT, GMST = 13h10m46.3668s.
        let t = Utc.with_ymd_and_hms(1987, 4, 10, 0, 0, 0).unwrap();
        let expected = (13.0 + 10.0 / 60.0 + 46.3668 / 3600.0) * 15.0;
        assert_abs_diff_eq!(mean_sidereal_time(&t).to_degrees(), expected,
                            epsilon = 0.01);
    }

}  // mod tests.
