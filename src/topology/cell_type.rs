//! Cell type metadata for mesh points.

use crate::bridge_error::BridgeError;

/// Entity shapes of the discretization toolkit's meshes.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CellType {
    /// 0D vertex.
    #[default]
    Vertex,
    /// 1D segment/edge.
    Segment,
    /// 2D simplex (triangle).
    Triangle,
    /// 2D tensor-product cell (quad).
    Quadrilateral,
    /// 3D simplex (tet).
    Tetrahedron,
    /// 3D tensor-product cell (hex).
    Hexahedron,
    /// 3D wedge/prism.
    Prism,
    /// 3D pyramid.
    Pyramid,
    /// 2D polygon with `n` vertices.
    Polygon(u8),
    /// Generic simplex with dimension `d`.
    Simplex(u8),
    /// Generic polyhedron.
    Polyhedron,
}

impl CellType {
    /// Returns the topological dimension of the cell, when well-defined.
    pub fn dimension(self) -> u8 {
        match self {
            CellType::Vertex => 0,
            CellType::Segment => 1,
            CellType::Triangle | CellType::Quadrilateral | CellType::Polygon(_) => 2,
            CellType::Tetrahedron
            | CellType::Hexahedron
            | CellType::Prism
            | CellType::Pyramid
            | CellType::Polyhedron => 3,
            CellType::Simplex(d) => d,
        }
    }

    /// The algebra-side shape for this cell type, folding generic simplices of
    /// dimension 0..=3 onto their named counterparts.
    ///
    /// # Errors
    /// `UnsupportedTopology` for general polygons, polyhedra and simplices of
    /// dimension above 3, which the distributed mesh cannot represent.
    pub fn to_supported(self) -> Result<CellType, BridgeError> {
        match self {
            CellType::Simplex(0) => Ok(CellType::Vertex),
            CellType::Simplex(1) => Ok(CellType::Segment),
            CellType::Simplex(2) => Ok(CellType::Triangle),
            CellType::Simplex(3) => Ok(CellType::Tetrahedron),
            CellType::Simplex(d) => Err(BridgeError::UnsupportedTopology(format!(
                "{d}-simplex has no distributed-mesh representation"
            ))),
            CellType::Polygon(n) => Err(BridgeError::UnsupportedTopology(format!(
                "general polygon with {n} vertices"
            ))),
            CellType::Polyhedron => Err(BridgeError::UnsupportedTopology(
                "general polyhedron".into(),
            )),
            other => Ok(other),
        }
    }

    /// Wire code of a supported cell type.
    pub(crate) fn code(self) -> u64 {
        match self {
            CellType::Vertex => 0,
            CellType::Segment => 1,
            CellType::Triangle => 2,
            CellType::Quadrilateral => 3,
            CellType::Tetrahedron => 4,
            CellType::Hexahedron => 5,
            CellType::Prism => 6,
            CellType::Pyramid => 7,
            CellType::Polygon(n) => 0x100 | u64::from(n),
            CellType::Simplex(d) => 0x200 | u64::from(d),
            CellType::Polyhedron => 0x300,
        }
    }

    pub(crate) fn from_code(code: u64) -> Option<CellType> {
        Some(match code {
            0 => CellType::Vertex,
            1 => CellType::Segment,
            2 => CellType::Triangle,
            3 => CellType::Quadrilateral,
            4 => CellType::Tetrahedron,
            5 => CellType::Hexahedron,
            6 => CellType::Prism,
            7 => CellType::Pyramid,
            0x300 => CellType::Polyhedron,
            c if c & !0xFF == 0x100 => CellType::Polygon((c & 0xFF) as u8),
            c if c & !0xFF == 0x200 => CellType::Simplex((c & 0xFF) as u8),
            _ => return None,
        })
    }
}
