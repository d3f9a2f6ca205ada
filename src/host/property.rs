//
// ccdhost - CCD camera driver host for amateur astronomy
// Copyright (c) 2020-2024 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Typed property vectors exchanged between devices and clients.
//!

use enum_dispatch::enum_dispatch;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    WriteOnly,
    ReadWrite
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany
}

#[derive(Debug, PartialEq)]
pub enum PropertyError {
    UnknownDevice(String),
    UnknownProperty(String),
    UnknownItem(String),
    ReadOnly(String),
    OutOfRange{ item: String, value: f64 },
    NotConnected,
    /// The request was valid, but the device refused or failed to execute it.
    Rejected(String)
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyError::UnknownDevice(name) => write!(f, "unknown device \"{}\"", name),
            PropertyError::UnknownProperty(name) => write!(f, "unknown property \"{}\"", name),
            PropertyError::UnknownItem(name) => write!(f, "unknown item \"{}\"", name),
            PropertyError::ReadOnly(name) => write!(f, "property \"{}\" is read-only", name),
            PropertyError::OutOfRange{ item, value } => write!(f, "value {} of \"{}\" out of range", value, item),
            PropertyError::NotConnected => write!(f, "device not connected"),
            PropertyError::Rejected(reason) => write!(f, "request rejected: {}", reason)
        }
    }
}

impl std::error::Error for PropertyError {}

#[derive(Clone, Debug)]
pub struct PropertyHeader {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub permission: Permission,
    pub state: PropertyState
}

impl PropertyHeader {
    pub fn new(device: &str, name: &str, label: &str, group: &str, permission: Permission) -> PropertyHeader {
        PropertyHeader{
            device: device.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            group: group.to_string(),
            permission,
            state: PropertyState::Idle
        }
    }
}

#[enum_dispatch]
#[derive(Clone, Debug)]
pub enum Property {
    Number(NumberVector),
    Switch(SwitchVector),
    Text(TextVector)
}

#[enum_dispatch(Property)]
pub trait PropertyBase {
    fn header(&self) -> &PropertyHeader;

    fn name(&self) -> &str { &self.header().name }

    fn label(&self) -> &str { &self.header().label }

    fn group(&self) -> &str { &self.header().group }

    fn state(&self) -> PropertyState { self.header().state }
}

#[derive(Clone, Debug)]
pub struct NumberItem {
    pub name: String,
    pub label: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64
}

impl NumberItem {
    pub fn new(name: &str, label: &str, min: f64, max: f64, step: f64, value: f64) -> NumberItem {
        NumberItem{ name: name.to_string(), label: label.to_string(), min, max, step, value }
    }
}

#[derive(Clone, Debug)]
pub struct NumberVector {
    pub header: PropertyHeader,
    pub items: Vec<NumberItem>
}

impl PropertyBase for NumberVector {
    fn header(&self) -> &PropertyHeader { &self.header }
}

impl NumberVector {
    pub fn new(header: PropertyHeader, items: Vec<NumberItem>) -> NumberVector {
        NumberVector{ header, items }
    }

    pub fn item(&self, name: &str) -> Option<&NumberItem> {
        self.items.iter().find(|i| i.name == name)
    }

    pub fn item_mut(&mut self, name: &str) -> Option<&mut NumberItem> {
        self.items.iter_mut().find(|i| i.name == name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.item(name).map(|i| i.value)
    }

    pub fn set_value(&mut self, name: &str, value: f64) -> bool {
        match self.item_mut(name) {
            Some(item) => { item.value = value; true },
            None => false
        }
    }

    pub fn set_state(&mut self, state: PropertyState) { self.header.state = state; }

    /// Checks that all `values` name existing items and lie within their limits.
    pub fn validate(&self, values: &[(&str, f64)]) -> Result<(), PropertyError> {
        for (name, value) in values {
            match self.item(name) {
                None => return Err(PropertyError::UnknownItem(name.to_string())),
                Some(item) => if !value.is_finite() || *value < item.min || *value > item.max {
                    return Err(PropertyError::OutOfRange{ item: name.to_string(), value: *value });
                }
            }
        }

        Ok(())
    }

    /// Assigns `values` to the matching items (unknown names are ignored).
    pub fn update(&mut self, values: &[(&str, f64)]) {
        for (name, value) in values {
            self.set_value(name, *value);
        }
    }
}

#[derive(Clone, Debug)]
pub struct SwitchItem {
    pub name: String,
    pub label: String,
    pub on: bool
}

impl SwitchItem {
    pub fn new(name: &str, label: &str, on: bool) -> SwitchItem {
        SwitchItem{ name: name.to_string(), label: label.to_string(), on }
    }
}

#[derive(Clone, Debug)]
pub struct SwitchVector {
    pub header: PropertyHeader,
    pub rule: SwitchRule,
    pub items: Vec<SwitchItem>
}

impl PropertyBase for SwitchVector {
    fn header(&self) -> &PropertyHeader { &self.header }
}

impl SwitchVector {
    pub fn new(header: PropertyHeader, rule: SwitchRule, items: Vec<SwitchItem>) -> SwitchVector {
        SwitchVector{ header, rule, items }
    }

    pub fn item(&self, name: &str) -> Option<&SwitchItem> {
        self.items.iter().find(|i| i.name == name)
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.item(name).map(|i| i.on).unwrap_or(false)
    }

    pub fn find_on(&self) -> Option<&SwitchItem> {
        self.items.iter().find(|i| i.on)
    }

    pub fn find_on_index(&self) -> Option<usize> {
        self.items.iter().position(|i| i.on)
    }

    pub fn reset(&mut self) {
        for item in &mut self.items { item.on = false; }
    }

    pub fn set_state(&mut self, state: PropertyState) { self.header.state = state; }

    /// Applies switch states honoring the vector's rule.
    pub fn update(&mut self, states: &[(&str, bool)]) -> Result<(), PropertyError> {
        for (name, _) in states {
            if self.item(name).is_none() {
                return Err(PropertyError::UnknownItem(name.to_string()));
            }
        }

        match self.rule {
            SwitchRule::AnyOfMany => (),
            SwitchRule::OneOfMany | SwitchRule::AtMostOne => {
                if states.iter().any(|(_, on)| *on) { self.reset(); }
            }
        }

        for (name, on) in states {
            if let Some(item) = self.items.iter_mut().find(|i| i.name == *name) {
                item.on = *on;
            }
        }

        if self.rule == SwitchRule::OneOfMany && self.find_on().is_none() {
            return Err(PropertyError::Rejected(format!("\"{}\" requires one switch on", self.header.name)));
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TextItem {
    pub name: String,
    pub label: String,
    pub text: String
}

#[derive(Clone, Debug)]
pub struct TextVector {
    pub header: PropertyHeader,
    pub items: Vec<TextItem>
}

impl PropertyBase for TextVector {
    fn header(&self) -> &PropertyHeader { &self.header }
}

impl TextVector {
    pub fn new(header: PropertyHeader, items: &[(&str, &str, &str)]) -> TextVector {
        TextVector{
            header,
            items: items.iter().map(|(name, label, text)| TextItem{
                name: name.to_string(),
                label: label.to_string(),
                text: text.to_string()
            }).collect()
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.items.iter().find(|i| i.name == name).map(|i| i.text.as_str())
    }
}
