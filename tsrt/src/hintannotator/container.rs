//! Annotations of the contents of virtual structs.
//!
//! Each `malloc` position owns one [ContainerDef] recording, per field, the union of every value
//! stored into the field. When two containers flow into the same variable their defs are unified;
//! when a container meets a plain run-time value the def *degenerates* and all of its fields
//! become red.

use super::{
    model::{ContainerIdx, HValue, Position},
    HintAnnotator,
};
use crate::{error::CompilationError, lltype::LLType};
use std::collections::HashSet;

#[derive(Debug)]
pub(crate) struct FieldValue {
    pub(crate) name: String,
    pub(crate) hs: HValue,
    read_positions: HashSet<Position>,
}

#[derive(Debug)]
pub(crate) struct ContainerDef {
    pub(crate) ty: LLType,
    pub(crate) fields: Vec<FieldValue>,
    pub(crate) degenerated: bool,
    /// Set once this def has been unified into another one.
    forwarded: Option<ContainerIdx>,
}

impl ContainerDef {
    /// A def for a freshly allocated `ty`, whose fields all start as zero constants.
    pub(crate) fn new(ty: &LLType) -> Result<Self, CompilationError> {
        let st = ty.struct_type().ok_or_else(|| {
            CompilationError::General(format!("malloc of non-struct type {ty}"))
        })?;
        Ok(Self {
            ty: ty.clone(),
            fields: st
                .fields
                .iter()
                .map(|(name, fty)| FieldValue {
                    name: name.clone(),
                    hs: HValue::constant(fty.clone()),
                    read_positions: HashSet::new(),
                })
                .collect(),
            degenerated: false,
            forwarded: None,
        })
    }

    fn field_index(&self, name: &str) -> Result<usize, CompilationError> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| CompilationError::General(format!("{} has no field '{name}'", self.ty)))
    }
}

impl HintAnnotator<'_> {
    /// The def that `def` has been unified into, if any.
    pub(crate) fn find_container(&self, mut def: ContainerIdx) -> ContainerIdx {
        while let Some(d) = self.containers[def].forwarded {
            def = d;
        }
        def
    }

    pub(crate) fn getvirtualcontainerdef(
        &mut self,
        pos: Position,
        ty: &LLType,
    ) -> Result<ContainerIdx, CompilationError> {
        if let Some(d) = self.bookkeeper.virtual_containers.get(&pos) {
            return Ok(self.find_container(*d));
        }
        let d = self.containers.push(ContainerDef::new(ty)?);
        self.bookkeeper.virtual_containers.insert(pos, d);
        Ok(d)
    }

    pub(crate) fn read_field(
        &mut self,
        def: ContainerIdx,
        name: &str,
        pos: Position,
    ) -> Result<HValue, CompilationError> {
        let def = self.find_container(def);
        let i = self.containers[def].field_index(name)?;
        let f = &mut self.containers[def].fields[i];
        f.read_positions.insert(pos);
        Ok(f.hs.clone())
    }

    pub(crate) fn generalize_field(
        &mut self,
        def: ContainerIdx,
        name: &str,
        hs: &HValue,
    ) -> Result<(), CompilationError> {
        let def = self.find_container(def);
        let i = self.containers[def].field_index(name)?;
        let old = self.containers[def].fields[i].hs.clone();
        let new = self.union(&old, hs)?;
        // The union may have unified or degenerated this very def.
        let def = self.find_container(def);
        let i = self.containers[def].field_index(name)?;
        if new != self.containers[def].fields[i].hs {
            let f = &mut self.containers[def].fields[i];
            f.hs = new;
            let readers = f.read_positions.iter().copied().collect::<Vec<_>>();
            for p in readers {
                self.reflow_from_position(p);
            }
        }
        Ok(())
    }

    /// Unify two defs, returning the surviving one.
    pub(crate) fn union_containers(
        &mut self,
        d1: ContainerIdx,
        d2: ContainerIdx,
    ) -> Result<ContainerIdx, CompilationError> {
        let (d1, d2) = (self.find_container(d1), self.find_container(d2));
        if d1 == d2 {
            return Ok(d1);
        }
        if self.containers[d1].ty != self.containers[d2].ty {
            return Err(CompilationError::InternalError(format!(
                "cannot unify containers of types {} and {}",
                self.containers[d1].ty, self.containers[d2].ty
            )));
        }
        self.containers[d2].forwarded = Some(d1);
        let fields = std::mem::take(&mut self.containers[d2].fields);
        let degenerated = self.containers[d2].degenerated;
        for f in fields {
            let d = self.find_container(d1);
            let i = self.containers[d].field_index(&f.name)?;
            self.containers[d].fields[i]
                .read_positions
                .extend(f.read_positions.iter().copied());
            self.generalize_field(d, &f.name, &f.hs)?;
            // Readers of the absorbed def saw its old value.
            for p in f.read_positions {
                self.reflow_from_position(p);
            }
        }
        if degenerated {
            self.mark_degenerated(d1)?;
        }
        Ok(self.find_container(d1))
    }

    /// Make every field of `def` red: the struct is mixed with run-time pointers, so nothing about
    /// its contents can be assumed.
    pub(crate) fn mark_degenerated(&mut self, def: ContainerIdx) -> Result<(), CompilationError> {
        let def = self.find_container(def);
        if self.containers[def].degenerated {
            return Ok(());
        }
        self.containers[def].degenerated = true;
        let fields = self.containers[def]
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.hs.ty().cloned()))
            .collect::<Vec<_>>();
        for (name, ty) in fields {
            if let Some(ty) = ty {
                self.generalize_field(def, &name, &HValue::variable(ty))?;
            }
        }
        Ok(())
    }
}
