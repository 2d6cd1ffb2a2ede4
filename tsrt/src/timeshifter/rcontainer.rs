//! Virtual structs: allocations that the specializer tracks field by field instead of emitting.
//!
//! A struct allocated by the program being specialized starts out as a [VirtualStruct] whose
//! fields are boxes. Reads and writes edit those boxes and generate nothing. Only when the
//! pointer escapes (it is stored somewhere, passed to a residual call, returned, or compared
//! in a way that needs its address) is the struct forced: a `malloc` plus one `setfield` per
//! field are emitted and the box turns into a plain variable.

use super::rvalue::{BoxIdx, Boxes, RedBox};
use crate::{
    codegen::{GenBuilder, GenVar},
    error::CompilationError,
    lltype::{tsrt_malloc, write_word, ContainerType, LLType, WORD},
};
use std::{collections::HashMap, rc::Rc};

#[derive(Debug)]
pub(crate) struct FieldDesc {
    pub(crate) name: String,
    pub(crate) kind: LLType,
    pub(crate) offset: i64,
}

/// Everything the specializer needs to know about one struct type.
#[derive(Debug)]
pub(crate) struct StructTypeDesc {
    /// The pointer type this describes.
    pub(crate) ptrtype: LLType,
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldDesc>,
    pub(crate) immutable: bool,
    pub(crate) noidentity: bool,
    pub(crate) size: i64,
}

impl StructTypeDesc {
    fn new(ptrtype: &LLType) -> Result<Self, CompilationError> {
        let st = ptrtype.struct_type().ok_or_else(|| {
            CompilationError::InternalError(format!("{ptrtype} is not a pointer to a struct"))
        })?;
        let fields = st
            .fields
            .iter()
            .zip(0..)
            .map(|((name, kind), i)| FieldDesc {
                name: name.clone(),
                kind: kind.clone(),
                offset: WORD * i,
            })
            .collect();
        Ok(Self {
            ptrtype: ptrtype.clone(),
            name: st.name.clone(),
            fields,
            immutable: st.immutable,
            noidentity: st.noidentity,
            size: st.size(),
        })
    }

    pub(crate) fn field_index(&self, name: &str) -> Result<usize, CompilationError> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| {
                CompilationError::General(format!("struct {} has no field '{name}'", self.name))
            })
    }

    /// Can an instance whose fields are all constant be replaced by a prebuilt copy?
    pub(crate) fn materializable(&self) -> bool {
        self.immutable && self.noidentity
    }

    /// Build a prebuilt instance holding `values`.
    fn materialize(&self, values: &[i64]) -> Result<i64, CompilationError> {
        let addr = tsrt_malloc(self.size);
        for (fd, v) in self.fields.iter().zip(values) {
            write_word(addr, fd.offset, *v)?;
        }
        Ok(addr)
    }
}

/// Struct descriptors, memoized per struct type.
#[derive(Default)]
pub(crate) struct TypeDescCache {
    descs: HashMap<*const ContainerType, Rc<StructTypeDesc>>,
}

impl TypeDescCache {
    pub(crate) fn get(&mut self, ptrtype: &LLType) -> Result<Rc<StructTypeDesc>, CompilationError> {
        let key = match ptrtype.container() {
            Some(c) => Rc::as_ptr(c),
            None => {
                return Err(CompilationError::InternalError(format!(
                    "{ptrtype} is not a pointer type"
                )))
            }
        };
        if let Some(d) = self.descs.get(&key) {
            return Ok(Rc::clone(d));
        }
        // The descriptor keeps the type alive, so `key` cannot be reused by another type.
        let d = Rc::new(StructTypeDesc::new(ptrtype)?);
        self.descs.insert(key, Rc::clone(&d));
        Ok(d)
    }
}

#[derive(Debug)]
pub(crate) struct VirtualStruct {
    pub(crate) desc: Rc<StructTypeDesc>,
    /// One box per field, in declaration order.
    pub(crate) fields: Vec<BoxIdx>,
}

impl Boxes {
    /// A new virtual instance of `desc` with every field zeroed.
    pub(crate) fn factory(&mut self, desc: &Rc<StructTypeDesc>) -> BoxIdx {
        let fields = desc
            .fields
            .iter()
            .map(|fd| self.constant(fd.kind.clone(), 0))
            .collect();
        self.push(RedBox::Virtual {
            kind: desc.ptrtype.clone(),
            content: VirtualStruct {
                desc: Rc::clone(desc),
                fields,
            },
        })
    }

    pub(crate) fn op_getfield(&self, b: BoxIdx, index: usize) -> Result<BoxIdx, CompilationError> {
        self.content(b)
            .and_then(|c| c.fields.get(index).copied())
            .ok_or_else(|| CompilationError::InternalError("getfield on a non-virtual".into()))
    }

    pub(crate) fn op_setfield(
        &mut self,
        b: BoxIdx,
        index: usize,
        value: BoxIdx,
    ) -> Result<(), CompilationError> {
        match self.content_mut(b).and_then(|c| c.fields.get_mut(index)) {
            Some(f) => {
                *f = value;
                Ok(())
            }
            None => Err(CompilationError::InternalError(
                "setfield on a non-virtual".into(),
            )),
        }
    }

    /// Turn the virtual box `b` into a real allocation and return its operand.
    pub(crate) fn force_runtime_container(
        &mut self,
        b: BoxIdx,
        builder: &mut dyn GenBuilder,
    ) -> Result<GenVar, CompilationError> {
        let (desc, fields) = match self.content(b) {
            Some(c) => (Rc::clone(&c.desc), c.fields.clone()),
            None => {
                return Err(CompilationError::InternalError(
                    "forcing a box that is not virtual".into(),
                ))
            }
        };
        let kind = desc.ptrtype.clone();
        if desc.materializable() {
            let values = fields
                .iter()
                .map(|f| self.constvalue(*f))
                .collect::<Option<Vec<_>>>();
            if let Some(values) = values {
                let addr = desc.materialize(&values)?;
                self.set(b, RedBox::Const { kind, value: addr });
                return Ok(GenVar::Const(addr));
            }
        }
        let gv = builder.genop_malloc_fixedsize(desc.size)?;
        // The box must stop being virtual before its fields are forced: they may point back to it.
        self.set(b, RedBox::Var { kind, gv });
        for (fd, f) in desc.fields.iter().zip(fields) {
            if fd.kind.is_void() {
                continue;
            }
            let v = self.getgenvar(f, builder)?;
            builder.genop_setfield(fd.offset, gv, v)?;
        }
        Ok(gv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::{x64::X64RGenOp, RGenOp},
        config::Config,
        lltype::{call_native, read_word},
        log::stats::Stats,
    };

    fn point() -> LLType {
        LLType::new_struct("Point", &[("x", LLType::Signed), ("y", LLType::Signed)], false)
    }

    #[test]
    fn descs_are_memoized() {
        let mut cache = TypeDescCache::default();
        let p = point();
        let d1 = cache.get(&p).unwrap();
        let d2 = cache.get(&p).unwrap();
        assert!(Rc::ptr_eq(&d1, &d2));
        assert_eq!(d1.size, 16);
        assert_eq!(d1.field_index("y").unwrap(), 1);
        assert_eq!(d1.fields[1].offset, 8);
        assert!(d1.field_index("z").is_err());
        assert!(!Rc::ptr_eq(&d1, &cache.get(&point()).unwrap()));
        assert!(cache.get(&LLType::Signed).is_err());
    }

    #[test]
    fn virtual_fields_and_forcing() {
        let rgenop = X64RGenOp::new(&Config::default(), Rc::new(Stats::new())).unwrap();
        let mut cache = TypeDescCache::default();
        let desc = cache.get(&point()).unwrap();
        let mut boxes = Boxes::default();
        let (mut b, entry, args) = rgenop.newgraph(1, "mkpoint").unwrap();
        let p = boxes.factory(&desc);
        let arg = boxes.var(LLType::Signed, args[0]);
        boxes.op_setfield(p, 1, arg).unwrap();
        let x = boxes.op_getfield(p, 0).unwrap();
        assert_eq!(boxes.constvalue(x), Some(0));
        let c = boxes.constant(LLType::Signed, 3);
        boxes.op_setfield(p, 0, c).unwrap();
        assert!(rgenop.insns().is_empty());
        let gv = boxes.getgenvar(p, &mut *b).unwrap();
        assert!(!boxes.is_virtual(p));
        assert_eq!(boxes.getgenvar(p, &mut *b).unwrap(), gv);
        b.finish_and_return(gv).unwrap();
        assert_eq!(rgenop.insns().get("malloc"), Some(&1));
        assert_eq!(rgenop.insns().get("setfield"), Some(&2));
        let addr = unsafe { call_native(entry as i64, &[11]) }.unwrap();
        assert_eq!(read_word(addr, 0).unwrap(), 3);
        assert_eq!(read_word(addr, 8).unwrap(), 11);
    }

    #[test]
    fn constant_value_structs_are_prebuilt() {
        let rgenop = X64RGenOp::new(&Config::default(), Rc::new(Stats::new())).unwrap();
        let pair = LLType::new_value_struct("Pair", &[("a", LLType::Signed), ("b", LLType::Signed)]);
        let mut cache = TypeDescCache::default();
        let desc = cache.get(&pair).unwrap();
        let mut boxes = Boxes::default();
        let (mut b, _, _) = rgenop.newgraph(0, "pair").unwrap();
        let p = boxes.factory(&desc);
        let c = boxes.constant(LLType::Signed, 42);
        boxes.op_setfield(p, 1, c).unwrap();
        let gv = boxes.getgenvar(p, &mut *b).unwrap();
        let addr = gv.revealconst().unwrap();
        assert!(boxes.is_constant(p));
        assert_eq!(read_word(addr, 8).unwrap(), 42);
        assert!(rgenop.insns().is_empty());
        b.end().unwrap();
    }

    #[test]
    fn self_referencing_virtual() {
        let rgenop = X64RGenOp::new(&Config::default(), Rc::new(Stats::new())).unwrap();
        let node = LLType::new_struct("Node", &[("next", LLType::Signed)], false);
        let mut cache = TypeDescCache::default();
        let desc = cache.get(&node).unwrap();
        let mut boxes = Boxes::default();
        let (mut b, entry, _) = rgenop.newgraph(0, "cycle").unwrap();
        let n = boxes.factory(&desc);
        boxes.op_setfield(n, 0, n).unwrap();
        let gv = boxes.getgenvar(n, &mut *b).unwrap();
        b.finish_and_return(gv).unwrap();
        let addr = unsafe { call_native(entry as i64, &[]) }.unwrap();
        assert_eq!(read_word(addr, 0).unwrap(), addr);
    }
}
