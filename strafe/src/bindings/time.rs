use chrono::{
    DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use mlua::{Lua, MetaMethod, Table, UserData, UserDataMethods};

use super::{function, register};

/// Layout of `Time:string()` and `tostring(time)`.
pub const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// A point in time with the offset it was observed or parsed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Time(pub DateTime<FixedOffset>);

impl Time {
    pub fn now() -> Self {
        Self(Local::now().fixed_offset())
    }

    pub fn string(&self) -> String {
        self.0.format(DEFAULT_FORMAT).to_string()
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        self.0.with_timezone(&Utc)
    }

    /// Parses `value` with a strftime `format`. Formats without an offset are
    /// read as UTC, formats without a time as midnight.
    pub fn parse(format: &str, value: &str) -> Result<Self, chrono::ParseError> {
        if let Ok(t) = DateTime::parse_from_str(value, format) {
            return Ok(Self(t));
        }
        let naive = match NaiveDateTime::parse_from_str(value, format) {
            Ok(naive) => naive,
            Err(e) => match NaiveDate::parse_from_str(value, format) {
                Ok(date) => date.and_hms_opt(0, 0, 0).ok_or(e)?,
                Err(_) => return Err(e),
            },
        };
        Ok(Self(Utc.from_utc_datetime(&naive).fixed_offset()))
    }
}

impl UserData for Time {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("string", |_, this, ()| Ok(this.string()));
        methods.add_method("format", |_, this, format: String| {
            Ok(this.0.format(&format).to_string())
        });
        methods.add_method("unix", |_, this, ()| Ok(this.0.timestamp()));
        methods.add_method("unix_nano", |_, this, ()| {
            this.0
                .timestamp_nanos_opt()
                .ok_or_else(|| mlua::Error::runtime("time out of range for nanoseconds"))
        });
        methods.add_method("year", |_, this, ()| Ok(this.0.year()));
        methods.add_method("year_day", |_, this, ()| Ok(this.0.ordinal()));
        methods.add_method("month", |_, this, ()| Ok(this.0.month()));
        methods.add_method("weekday", |_, this, ()| {
            Ok(this.0.weekday().num_days_from_sunday())
        });
        methods.add_method("day", |_, this, ()| Ok(this.0.day()));
        methods.add_method("hour", |_, this, ()| Ok(this.0.hour()));
        methods.add_method("minute", |_, this, ()| Ok(this.0.minute()));
        methods.add_method("second", |_, this, ()| Ok(this.0.second()));
        methods.add_method("nanosecond", |_, this, ()| Ok(this.0.nanosecond()));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.string()));
        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (Time, Time)| Ok(a == b));
        methods.add_meta_function(MetaMethod::Lt, |_, (a, b): (Time, Time)| Ok(a.0 < b.0));
        methods.add_meta_function(MetaMethod::Le, |_, (a, b): (Time, Time)| Ok(a.0 <= b.0));
    }
}

impl mlua::FromLua for Time {
    fn from_lua(value: mlua::Value, _: &Lua) -> mlua::Result<Self> {
        match value {
            mlua::Value::UserData(ud) => Ok(*ud.borrow::<Time>()?),
            other => Err(mlua::Error::runtime(format!(
                "expected time, got {}",
                other.type_name()
            ))),
        }
    }
}

pub fn open(lua: &Lua) -> mlua::Result<()> {
    let module: Table = lua.create_table()?;
    module.set("now", function(lua, |_, ()| Ok(Time::now()))?)?;
    module.set(
        "parse",
        function(lua, |_, (format, value): (String, String)| {
            Time::parse(&format, &value).map_err(mlua::Error::external)
        })?,
    )?;
    module.set(
        "unix",
        function(lua, |_, (secs, nanos): (i64, Option<u32>)| {
            DateTime::from_timestamp(secs, nanos.unwrap_or(0))
                .map(|t| Time(t.fixed_offset()))
                .ok_or_else(|| mlua::Error::runtime("timestamp out of range"))
        })?,
    )?;
    register(lua, "time", module)
}
