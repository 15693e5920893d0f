use super::app;
use super::message;
use super::session;
use std::fmt;

pub type MethodHandler = fn(
    &mut Box<dyn app::ApplicationWorker>,
    &mut session::ServerSession,
    &message::Method,
) -> Result<(), String>;

#[derive(Debug, Copy, Clone)]
pub enum ParamCount {
    Any,
    Zero,
    Exactly(u8),
    AtLeast(u8),
    Range(u8, u8), // Inclusive
}

impl ParamCount {
    /// Returns true if the number of params provided matches the
    /// number specified by the ParamCount enum.
    ///
    /// ```
    /// use ferrosrf::method::ParamCount;
    /// assert!(ParamCount::matches(&ParamCount::Any, 0));
    /// assert!(!ParamCount::matches(&ParamCount::Exactly(1), 10));
    /// assert!(ParamCount::matches(&ParamCount::AtLeast(10), 20));
    /// assert!(!ParamCount::matches(&ParamCount::AtLeast(20), 10));
    /// assert!(ParamCount::matches(&ParamCount::Range(4, 6), 5));
    /// ```
    pub fn matches(pc: &ParamCount, count: u8) -> bool {
        match *pc {
            ParamCount::Any => {
                return true;
            }
            ParamCount::Zero => {
                return count == 0;
            }
            ParamCount::Exactly(c) => {
                return count == c;
            }
            ParamCount::AtLeast(c) => {
                return count >= c;
            }
            ParamCount::Range(s, e) => {
                return s <= count && e >= count;
            }
        }
    }
}

impl fmt::Display for ParamCount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParamCount::Any => write!(f, "Any"),
            ParamCount::Zero => write!(f, "Zero"),
            ParamCount::Exactly(c) => write!(f, "Exactly {}", c),
            ParamCount::AtLeast(c) => write!(f, "AtLeast {}", c),
            ParamCount::Range(s, e) => write!(f, "Between {}..{}", s, e),
        }
    }
}

/// A variation of a Method that can be used when creating static
/// method definitions.
pub struct MethodDef {
    pub name: &'static str,
    pub param_count: ParamCount,
    pub handler: MethodHandler,
}

impl MethodDef {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn param_count(&self) -> &ParamCount {
        &self.param_count
    }
    pub fn handler(&self) -> &MethodHandler {
        &self.handler
    }
}

/// Simplest possible breakdown of supported parameter base types.
#[derive(Debug, Copy, Clone)]
pub enum ParamDataType {
    String,
}

impl fmt::Display for ParamDataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParamDataType::String => write!(f, "String"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub required: bool,
    pub name: String,
    pub datatype: ParamDataType,
    pub desc: Option<String>,
}

#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub desc: Option<String>,
    pub atomic: bool,
    pub param_count: ParamCount,
    pub params: Option<Vec<Param>>,
    pub handler: MethodHandler,
}

impl Method {
    pub fn new(name: &str, param_count: ParamCount, handler: MethodHandler) -> Method {
        Method {
            handler,
            param_count,
            name: name.to_string(),
            desc: None,
            atomic: false,
            params: None,
        }
    }

    pub fn param_count(&self) -> &ParamCount {
        &self.param_count
    }

    pub fn handler(&self) -> MethodHandler {
        self.handler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn set_desc(&mut self, desc: &str) {
        self.desc = Some(desc.to_string());
    }

    pub fn set_atomic(&mut self, atomic: bool) {
        self.atomic = atomic;
    }

    pub fn add_param(&mut self, param: Param) {
        self.params.get_or_insert_with(Vec::new).push(param);
    }

    pub fn to_json_value(&self) -> json::JsonValue {
        let mut params = json::JsonValue::new_array();
        if let Some(list) = &self.params {
            for param in list {
                params
                    .push(json::object! {
                        name: param.name.clone(),
                        required: param.required,
                        datatype: param.datatype.to_string(),
                        desc: match &param.desc {
                            Some(d) => json::from(d.clone()),
                            None => json::JsonValue::Null,
                        },
                    })
                    .ok();
            }
        }

        json::object! {
            api_name: self.name.clone(),
            argc: self.param_count.to_string(),
            atomic: self.atomic,
            stream: true,
            params: params,
            desc: match &self.desc {
                Some(d) => json::from(d.clone()),
                None => json::JsonValue::Null,
            },
        }
    }
}
