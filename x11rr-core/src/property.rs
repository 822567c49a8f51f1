//! Typed property lists attached to outputs and providers
//!
//! Each property has a current value and, when configured as pending, a
//! staged value that only becomes current after a successful crtc set.

use crate::atom::{NON_DESKTOP, XA_INTEGER};
use crate::driver::{DriverError, DriverResult};
use crate::error::{RrError, RrResult};
use crate::event::{Notify, PropertyState};
use crate::output::Output;
use crate::provider::Provider;
use crate::screen::{Randr, Screen};
use crate::types::{Atom, OutputId, ProviderId, ScreenId, Timestamp, NONE};

/// `AnyPropertyType` on the wire
pub const ANY_PROPERTY_TYPE: Atom = NONE;

/// How new data combines with an existing value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropMode {
    Replace = 0,
    Prepend = 1,
    Append = 2,
}

impl TryFrom<u8> for PropMode {
    type Error = RrError;

    fn try_from(mode: u8) -> RrResult<Self> {
        match mode {
            0 => Ok(PropMode::Replace),
            1 => Ok(PropMode::Prepend),
            2 => Ok(PropMode::Append),
            other => Err(RrError::Value(other as u32)),
        }
    }
}

/// A typed value. `data` is in host byte order, `format / 8` bytes per item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyValue {
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

impl PropertyValue {
    pub fn new(type_: Atom, format: u8, data: Vec<u8>) -> Self {
        Self { type_, format, data }
    }

    /// Single 32 bit integer
    pub fn from_u32(type_: Atom, value: u32) -> Self {
        Self::new(type_, 32, value.to_ne_bytes().to_vec())
    }

    pub fn item_size(&self) -> usize {
        (self.format / 8) as usize
    }

    pub fn len(&self) -> usize {
        match self.item_size() {
            0 => 0,
            size => self.data.len() / size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Items widened to i64, for validation against valid values
    pub fn items(&self) -> Vec<i64> {
        match self.format {
            8 => self.data.iter().map(|&b| b as i8 as i64).collect(),
            16 => self
                .data
                .chunks_exact(2)
                .map(|c| i16::from_ne_bytes([c[0], c[1]]) as i64)
                .collect(),
            32 => self
                .data
                .chunks_exact(4)
                .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// First item as an unsigned integer
    pub fn first_u32(&self) -> Option<u32> {
        match self.format {
            8 => self.data.first().map(|&b| b as u32),
            16 => self.data.get(..2).map(|c| u16::from_ne_bytes([c[0], c[1]]) as u32),
            32 => self
                .data
                .get(..4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: Atom,
    pub is_pending: bool,
    pub range: bool,
    pub immutable: bool,
    pub current: PropertyValue,
    pub pending: PropertyValue,
    pub valid_values: Vec<i32>,
}

impl Property {
    fn new(name: Atom) -> Self {
        Self {
            name,
            is_pending: false,
            range: false,
            immutable: false,
            current: PropertyValue::default(),
            pending: PropertyValue::default(),
            valid_values: Vec::new(),
        }
    }

    /// Value a read sees
    pub fn value(&self, pending: bool) -> &PropertyValue {
        if pending && self.is_pending {
            &self.pending
        } else {
            &self.current
        }
    }

    /// Pending value staged and not yet applied
    pub fn has_staged_change(&self) -> bool {
        self.is_pending && self.pending.format != 0 && self.pending != self.current
    }
}

/// What a successful change touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Changed {
    /// The property did not exist before
    pub created: bool,
    /// The write landed in the pending slot
    pub staged: bool,
}

/// Result of a GetProperty style read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRead {
    pub type_: Atom,
    pub format: u8,
    /// Bytes left after the returned slice
    pub bytes_after: u32,
    pub data: Vec<u8>,
}

impl PropertyRead {
    pub fn none() -> Self {
        Self {
            type_: NONE,
            format: 0,
            bytes_after: 0,
            data: Vec::new(),
        }
    }

    pub fn num_items(&self) -> u32 {
        match self.format {
            0 => 0,
            format => (self.data.len() / (format / 8) as usize) as u32,
        }
    }
}

/// Slice a value for GetProperty. Offsets and lengths are in 4 byte units.
pub fn read_value(
    value: &PropertyValue,
    req_type: Atom,
    long_offset: u32,
    long_length: u32,
) -> RrResult<PropertyRead> {
    let size = value.data.len() as u64;
    if req_type != ANY_PROPERTY_TYPE && req_type != value.type_ {
        return Ok(PropertyRead {
            type_: value.type_,
            format: value.format,
            bytes_after: size as u32,
            data: Vec::new(),
        });
    }

    let start = 4 * long_offset as u64;
    if start > size {
        return Err(RrError::Value(long_offset));
    }
    let len = (size - start).min(4 * long_length as u64);
    let end = start + len;
    Ok(PropertyRead {
        type_: value.type_,
        format: value.format,
        bytes_after: (size - end) as u32,
        data: value.data[start as usize..end as usize].to_vec(),
    })
}

/// Properties on one object, in creation order
#[derive(Debug, Clone, Default)]
pub struct PropertyList {
    props: Vec<Property>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: Atom) -> Option<&Property> {
        self.props.iter().find(|p| p.name == name)
    }

    fn position(&self, name: Atom) -> Option<usize> {
        self.props.iter().position(|p| p.name == name)
    }

    /// Names, most recently created first
    pub fn names(&self) -> Vec<Atom> {
        self.props.iter().rev().map(|p| p.name).collect()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn clear(&mut self) -> Vec<Property> {
        std::mem::take(&mut self.props)
    }

    /// Write data into a property, creating it if needed.
    ///
    /// `accept` sees the fully combined value before anything is stored;
    /// returning false leaves the list untouched and fails with BadValue.
    pub fn change(
        &mut self,
        name: Atom,
        type_: Atom,
        format: u8,
        mode: PropMode,
        data: &[u8],
        pending: bool,
        accept: impl FnOnce(&PropertyValue) -> bool,
    ) -> RrResult<Changed> {
        let index = self.position(name);
        let created = index.is_none();
        let fresh;
        let (mode, prop) = match index {
            Some(i) => (mode, &self.props[i]),
            None => {
                fresh = Property::new(name);
                (PropMode::Replace, &fresh)
            }
        };
        let staged = pending && prop.is_pending;
        let old = if staged { &prop.pending } else { &prop.current };

        if mode != PropMode::Replace && (old.format != format || old.type_ != type_) {
            return Err(RrError::Match(name));
        }
        if mode != PropMode::Replace && data.is_empty() {
            return Ok(Changed { created, staged });
        }

        let mut bytes = Vec::with_capacity(old.data.len() + data.len());
        match mode {
            PropMode::Replace => bytes.extend_from_slice(data),
            PropMode::Append => {
                bytes.extend_from_slice(&old.data);
                bytes.extend_from_slice(data);
            }
            PropMode::Prepend => {
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(&old.data);
            }
        }
        let value = PropertyValue::new(type_, format, bytes);

        if pending && !accept(&value) {
            return Err(RrError::Value(name));
        }

        let prop = match index {
            Some(i) => &mut self.props[i],
            None => {
                self.props.push(Property::new(name));
                let last = self.props.len() - 1;
                &mut self.props[last]
            }
        };
        if staged {
            prop.pending = value;
        } else {
            prop.current = value;
        }
        Ok(Changed { created, staged })
    }

    /// Define validation metadata, creating the property if needed
    pub fn configure(
        &mut self,
        name: Atom,
        pending: bool,
        range: bool,
        immutable: bool,
        valid_values: &[i32],
    ) -> RrResult<()> {
        if range && valid_values.len() % 2 != 0 {
            return Err(RrError::Match(name));
        }
        match self.position(name) {
            Some(i) => {
                let prop = &mut self.props[i];
                if prop.immutable && !immutable {
                    return Err(RrError::Access(name));
                }
                // Dropping pending mode discards whatever was staged
                if prop.is_pending && !pending {
                    prop.pending = PropertyValue::default();
                }
                prop.is_pending = pending;
                prop.range = range;
                prop.immutable = immutable;
                prop.valid_values = valid_values.to_vec();
            }
            None => {
                let mut prop = Property::new(name);
                prop.is_pending = pending;
                prop.range = range;
                prop.immutable = immutable;
                prop.valid_values = valid_values.to_vec();
                self.props.push(prop);
            }
        }
        Ok(())
    }

    /// Remove a property. Missing names are not an error.
    pub fn delete(&mut self, name: Atom) -> RrResult<Option<Property>> {
        let Some(i) = self.position(name) else {
            return Ok(None);
        };
        if self.props[i].immutable {
            return Err(RrError::Access(name));
        }
        Ok(Some(self.props.remove(i)))
    }

    /// Replace the current value with what the driver reports
    pub(crate) fn refresh(&mut self, name: Atom, value: PropertyValue) {
        if let Some(i) = self.position(name) {
            self.props[i].current = value;
        }
    }

    /// Drop a property regardless of mutability
    pub(crate) fn remove(&mut self, name: Atom) -> Option<Property> {
        let i = self.position(name)?;
        Some(self.props.remove(i))
    }

    /// Staged values that differ from the current ones
    pub fn staged_changes(&self) -> Vec<(Atom, PropertyValue)> {
        self.props
            .iter()
            .filter(|p| p.has_staged_change())
            .map(|p| (p.name, p.pending.clone()))
            .collect()
    }

    pub fn has_staged_changes(&self) -> bool {
        self.props.iter().any(Property::has_staged_change)
    }
}

/// Object a property list hangs off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOwner {
    Output(OutputId),
    Provider(ProviderId),
}

impl From<OutputId> for PropertyOwner {
    fn from(id: OutputId) -> Self {
        PropertyOwner::Output(id)
    }
}

impl From<ProviderId> for PropertyOwner {
    fn from(id: ProviderId) -> Self {
        PropertyOwner::Provider(id)
    }
}

/// Driver verdict on a pending write; a missing hook accepts
fn accepted(result: DriverResult<()>) -> bool {
    match result {
        Ok(()) | Err(DriverError::NotImplemented) => true,
        Err(err) => {
            log::debug!("property write refused: {}", err);
            false
        }
    }
}

/// Property list and pending flag of `owner` on `screen`
fn owner_slots(screen: &mut Screen, owner: PropertyOwner) -> RrResult<(&mut PropertyList, &mut bool)> {
    slots_in(&mut screen.outputs, &mut screen.provider, owner)
}

fn slots_in<'a>(
    outputs: &'a mut [Output],
    provider: &'a mut Option<Provider>,
    owner: PropertyOwner,
) -> RrResult<(&'a mut PropertyList, &'a mut bool)> {
    match owner {
        PropertyOwner::Output(id) => outputs
            .iter_mut()
            .find(|o| o.id == id)
            .map(|o| (&mut o.properties, &mut o.pending_properties))
            .ok_or(RrError::Output(id.0)),
        PropertyOwner::Provider(id) => provider
            .as_mut()
            .filter(|p| p.id == id)
            .map(|p| (&mut p.properties, &mut p.pending_properties))
            .ok_or(RrError::Provider(id.0)),
    }
}

impl Randr {
    fn owner_screen(&self, owner: PropertyOwner) -> RrResult<ScreenId> {
        match owner {
            PropertyOwner::Output(id) => Ok(self.find_output(id)?.0),
            PropertyOwner::Provider(id) => self.find_provider(id),
        }
    }

    fn owner_is_leased(&self, owner: PropertyOwner) -> bool {
        match owner {
            PropertyOwner::Output(id) => self.output_is_leased(id),
            PropertyOwner::Provider(_) => false,
        }
    }

    pub fn properties(&self, owner: PropertyOwner) -> RrResult<&PropertyList> {
        match owner {
            PropertyOwner::Output(id) => Ok(&self.output(id)?.properties),
            PropertyOwner::Provider(id) => Ok(&self.provider(id)?.properties),
        }
    }

    fn property_event(&mut self, owner: PropertyOwner, atom: Atom, state: PropertyState) {
        let Ok(screen) = self.owner_screen(owner) else {
            return;
        };
        let Some(primary) = self.primary_of(screen) else {
            return;
        };
        let timestamp = Timestamp::now();
        let notify = match owner {
            PropertyOwner::Output(output) => Notify::OutputProperty {
                output,
                atom,
                timestamp,
                state,
            },
            PropertyOwner::Provider(provider) => Notify::ProviderProperty {
                provider,
                atom,
                timestamp,
                state,
            },
        };
        self.push_event(primary, notify);
    }

    /// Names on `owner`, newest first
    pub fn list_properties(&self, owner: PropertyOwner) -> RrResult<Vec<Atom>> {
        Ok(self.properties(owner)?.names())
    }

    pub fn query_property(&self, owner: PropertyOwner, name: Atom) -> RrResult<Property> {
        self.properties(owner)?.get(name).cloned().ok_or(RrError::Name(name))
    }

    pub fn configure_property(
        &mut self,
        owner: PropertyOwner,
        name: Atom,
        pending: bool,
        range: bool,
        immutable: bool,
        valid_values: &[i32],
    ) -> RrResult<()> {
        let screen = self.owner_screen(owner)?;
        let (list, _) = owner_slots(self.screen_mut(screen), owner)?;
        list.configure(name, pending, range, immutable, valid_values)
    }

    /// ConfigureOutputProperty / ConfigureProviderProperty from a client
    pub fn configure_property_request(
        &mut self,
        owner: PropertyOwner,
        name: Atom,
        pending: bool,
        range: bool,
        valid_values: &[i32],
    ) -> RrResult<()> {
        self.owner_screen(owner)?;
        if self.owner_is_leased(owner) {
            return Err(RrError::Access(name));
        }
        if !self.atoms.is_valid(name) {
            return Err(RrError::Atom(name));
        }
        self.configure_property(owner, name, pending, range, false, valid_values)
    }

    /// Write property data. Writes to a pending property with `pending`
    /// set are staged until the next successful crtc set.
    #[allow(clippy::too_many_arguments)]
    pub fn change_property(
        &mut self,
        owner: PropertyOwner,
        name: Atom,
        type_: Atom,
        format: u8,
        mode: PropMode,
        data: &[u8],
        send_event: bool,
        pending: bool,
    ) -> RrResult<()> {
        let screen = self.owner_screen(owner)?;
        let Screen {
            driver,
            outputs,
            provider,
            ..
        } = self.screen_mut(screen);
        let (list, has_pending) = slots_in(outputs, provider, owner)?;
        let changed = list.change(name, type_, format, mode, data, pending, |value| match owner {
            PropertyOwner::Output(id) => accepted(driver.output_set_property(id, name, value)),
            PropertyOwner::Provider(id) => accepted(driver.provider_set_property(id, name, value)),
        })?;

        if changed.staged {
            *has_pending = true;
        } else if let PropertyOwner::Output(id) = owner {
            self.notice_property_change(id, name)?;
        }
        if send_event {
            self.property_event(owner, name, PropertyState::NewValue);
        }
        Ok(())
    }

    /// Side effects of well-known output properties
    fn notice_property_change(&mut self, id: OutputId, name: Atom) -> RrResult<()> {
        if self.atoms.get_id(NON_DESKTOP) != Some(name) {
            return Ok(());
        }
        let output = self.output_mut(id)?;
        let Some(value) = output.properties.get(name).map(|p| &p.current) else {
            return Ok(());
        };
        if value.type_ != XA_INTEGER || value.format != 32 || value.len() < 1 {
            return Ok(());
        }
        let non_desktop = value.first_u32() != Some(0);
        if non_desktop == output.non_desktop {
            return Ok(());
        }
        output.non_desktop = non_desktop;
        let screen = output.screen;
        log::debug!("output {:#x} non-desktop={}", id.0, non_desktop);
        self.output_changed(id, false)?;
        self.tell_changed(screen);
        Ok(())
    }

    /// ChangeOutputProperty / ChangeProviderProperty from a client
    pub fn change_property_request(
        &mut self,
        owner: PropertyOwner,
        name: Atom,
        type_: Atom,
        format: u8,
        mode: u8,
        data: &[u8],
    ) -> RrResult<()> {
        self.owner_screen(owner)?;
        let mode = PropMode::try_from(mode)?;
        if !matches!(format, 8 | 16 | 32) {
            return Err(RrError::Value(format as u32));
        }
        if !self.atoms.is_valid(name) {
            return Err(RrError::Atom(name));
        }
        if !self.atoms.is_valid(type_) {
            return Err(RrError::Atom(type_));
        }
        if self.owner_is_leased(owner) {
            return Err(RrError::Access(name));
        }
        self.change_property(owner, name, type_, format, mode, data, true, true)
    }

    pub fn delete_property(&mut self, owner: PropertyOwner, name: Atom) -> RrResult<()> {
        let screen = self.owner_screen(owner)?;
        if self.owner_is_leased(owner) {
            return Err(RrError::Access(name));
        }
        if !self.atoms.is_valid(name) {
            return Err(RrError::Atom(name));
        }
        let (list, _) = owner_slots(self.screen_mut(screen), owner)?;
        match list.delete(name)? {
            Some(_) => {
                self.property_event(owner, name, PropertyState::Deleted);
                Ok(())
            }
            None => Err(RrError::Name(name)),
        }
    }

    /// GetOutputProperty / GetProviderProperty. Non-pending reads let the
    /// driver refresh the value first.
    #[allow(clippy::too_many_arguments)]
    pub fn get_property(
        &mut self,
        owner: PropertyOwner,
        name: Atom,
        type_: Atom,
        long_offset: u32,
        long_length: u32,
        delete: bool,
        pending: bool,
    ) -> RrResult<PropertyRead> {
        let screen = self.owner_screen(owner)?;
        if !self.atoms.is_valid(name) {
            return Err(RrError::Atom(name));
        }
        if type_ != ANY_PROPERTY_TYPE && !self.atoms.is_valid(type_) {
            return Err(RrError::Atom(type_));
        }
        let Some(prop) = self.properties(owner)?.get(name) else {
            return Ok(PropertyRead::none());
        };
        if prop.immutable && delete {
            return Err(RrError::Access(name));
        }
        let staged_read = pending && prop.is_pending;

        if !staged_read {
            let scr = self.screen_mut(screen);
            let refreshed = match owner {
                PropertyOwner::Output(id) => scr.driver.output_get_property(id, name),
                PropertyOwner::Provider(id) => scr.driver.provider_get_property(id, name),
            };
            if let Ok(Some(value)) = refreshed {
                owner_slots(scr, owner)?.0.refresh(name, value);
            }
        }

        let Some(prop) = self.properties(owner)?.get(name) else {
            return Ok(PropertyRead::none());
        };
        let value = prop.value(pending);
        let read = read_value(value, type_, long_offset, long_length)?;
        let type_matched = type_ == ANY_PROPERTY_TYPE || type_ == value.type_;
        if delete && type_matched && read.bytes_after == 0 {
            owner_slots(self.screen_mut(screen), owner)?.0.remove(name);
            self.property_event(owner, name, PropertyState::Deleted);
        }
        Ok(read)
    }

    /// Make staged values current after a successful set. Returns false
    /// when some value could not be applied.
    pub fn post_pending_properties(&mut self, owner: impl Into<PropertyOwner>) -> bool {
        let owner = owner.into();
        let Ok(screen) = self.owner_screen(owner) else {
            return false;
        };
        let Ok((list, has_pending)) = owner_slots(self.screen_mut(screen), owner) else {
            return false;
        };
        if !*has_pending {
            return true;
        }
        *has_pending = false;
        let staged = list.staged_changes();

        let mut ok = true;
        for (name, value) in staged {
            let applied = self.change_property(
                owner,
                name,
                value.type_,
                value.format,
                PropMode::Replace,
                &value.data,
                true,
                false,
            );
            if let Err(err) = applied {
                log::warn!("{:?}: pending property {} not applied: {}", owner, name, err);
                ok = false;
            }
        }
        ok
    }
}
